//! The dialplan router (§4.10): classifies an INVITE's destination and
//! either forwards it internally (with no-answer divert to voicemail),
//! starts a voicemail-access IVR session, or rejects it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pbx_dialog::client::{self, InviteOutcome};
use pbx_dialog::transaction::TransactionTable;
use pbx_media::prompts::PromptResolver;
use pbx_registrar::registrar::Registrar;
use pbx_rtp::player::{Player, Recorder};
use pbx_rtp::relay::RtpRelay;
use pbx_sip::message::SipMessage;
use pbx_sip::status::StatusCode;
use pbx_voicemail::driver::IvrDriver;
use pbx_voicemail::ivr::IvrSession;
use pbx_voicemail::sink::VoicemailSink;
use regex::Regex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::call::{Call, CallManager, CallState};
use crate::cdr::{CdrSink, Disposition};

/// How an internal route's second leg settled (see [`Router::route_internal`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalRouteOutcome {
    Bridged,
    Divert,
}

/// A dialplan classification outcome (§4.10's ordered pattern list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    VoicemailAccess(String),
    Emergency,
    AutoAttendant,
    Parking(String),
    Queue(String),
    Internal(String),
    NotFound,
}

pub struct Router {
    pub call_manager: Arc<CallManager>,
    pub registrar: Arc<Registrar>,
    pub relay: Arc<RtpRelay>,
    pub voicemail_sink: Arc<dyn VoicemailSink>,
    pub prompts: Arc<PromptResolver>,
    pub cdr: Arc<dyn CdrSink>,
    socket: Arc<UdpSocket>,
    transactions: Arc<TransactionTable>,
    local_address: String,
    voicemail_access_re: Regex,
    parking_re: Regex,
    queue_re: Regex,
    internal_re: Regex,
    no_answer_timeout: Duration,
    max_record_seconds: u64,
    dtmf_debounce: Duration,
    rtp_payload_type: u8,
}

#[allow(clippy::too_many_arguments)]
impl Router {
    pub fn new(
        call_manager: Arc<CallManager>,
        registrar: Arc<Registrar>,
        relay: Arc<RtpRelay>,
        voicemail_sink: Arc<dyn VoicemailSink>,
        prompts: Arc<PromptResolver>,
        cdr: Arc<dyn CdrSink>,
        socket: Arc<UdpSocket>,
        transactions: Arc<TransactionTable>,
        local_address: String,
        internal_pattern: &str,
        no_answer_timeout: Duration,
        max_record_seconds: u64,
        dtmf_debounce: Duration,
        rtp_payload_type: u8,
    ) -> Self {
        Router {
            call_manager,
            registrar,
            relay,
            voicemail_sink,
            prompts,
            cdr,
            socket,
            transactions,
            local_address,
            voicemail_access_re: Regex::new(r"^\*(\d+)$").unwrap(),
            parking_re: Regex::new(r"^7\d$").unwrap(),
            queue_re: Regex::new(r"^8\d{3}$").unwrap(),
            internal_re: Regex::new(internal_pattern).expect("dialplan.internal_pattern must be a valid regex"),
            no_answer_timeout,
            max_record_seconds,
            dtmf_debounce,
            rtp_payload_type,
        }
    }

    /// Classify a Request-URI's user-part in the §4.10 priority order.
    pub fn classify(&self, destination: &str) -> Destination {
        if let Some(captures) = self.voicemail_access_re.captures(destination) {
            return Destination::VoicemailAccess(captures[1].to_string());
        }
        if destination == "911" || destination == "9911" {
            return Destination::Emergency;
        }
        if destination == "0" {
            return Destination::AutoAttendant;
        }
        if self.parking_re.is_match(destination) {
            return Destination::Parking(destination.to_string());
        }
        if self.queue_re.is_match(destination) {
            return Destination::Queue(destination.to_string());
        }
        if self.internal_re.is_match(destination) {
            return Destination::Internal(destination.to_string());
        }
        Destination::NotFound
    }

    /// Start a voicemail-access IVR session for `extension` on behalf
    /// of `call` (§4.10 "Voicemail-access routing"). The caller's RTP
    /// leg has already been connected at `caller_rtp`; this allocates
    /// the Player/Recorder against it and spawns the IVR task.
    pub async fn start_voicemail_access(&self, call: &Call, extension: &str, stored_pin: &str, caller_rtp: std::net::SocketAddr) {
        self.call_manager.connect(&call.id).ok();
        let Some(entry) = self.relay.entry(&call.id) else {
            warn!(call_id = %call.id, "no relay entry for voicemail access call");
            return;
        };
        entry.stop_forwarding();
        let player = Arc::new(Player::new(entry.socket().clone(), caller_rtp, rand::random(), self.rtp_payload_type));
        let recorder = Arc::new(Recorder::new(entry.socket().clone()));

        let Some(info_digits) = self.call_manager.take_dtmf_receiver(&call.id) else {
            warn!(call_id = %call.id, "DTMF receiver already claimed for this call");
            return;
        };
        let call_ended = to_bool_watch(self.call_manager.get(&call.id).map(|c| c.state_watch()));

        let session = IvrSession::new(stored_pin);
        let mut driver = IvrDriver::with_timing(
            session,
            player,
            recorder,
            self.prompts.clone(),
            self.voicemail_sink.clone(),
            extension.to_string(),
            call.from.clone(),
            info_digits,
            call_ended,
            Duration::from_secs(self.max_record_seconds),
            self.dtmf_debounce,
        );

        let call_manager = self.call_manager.clone();
        let call_id = call.id.clone();
        tokio::spawn(async move {
            driver.run().await;
            call_manager.end(&call_id);
        });
    }

    /// Route an internal call (§4.10 "Internal routing"): originate a
    /// real second leg to the registered contact, relaying its 100
    /// Trying immediately and any 180 Ringing back to the caller. The
    /// caller's own 200 OK is the caller of this method's
    /// responsibility, sent once this settles — on [`InternalRouteOutcome::Bridged`]
    /// the second leg has already been answered and ACKed; on
    /// [`InternalRouteOutcome::Divert`] the caller should send its 200
    /// OK and then run [`Self::divert_to_voicemail`] (not done here, since
    /// that recording can run for minutes and must not hold up the
    /// INVITE transaction). `offer_body` is the SDP this PBX already
    /// answered the caller with — re-sent as this PBX's own offer to
    /// the callee, since both legs bridge through the same relay port
    /// regardless of which one is "caller".
    pub async fn route_internal(
        &self,
        call: &Call,
        extension: &str,
        caller_source: SocketAddr,
        original_request: &SipMessage,
        offer_body: Vec<u8>,
    ) -> InternalRouteOutcome {
        self.call_manager.ring(&call.id).ok();
        self.send_to_caller(original_request, caller_source, StatusCode::TRYING).await;

        let contact = self.registrar.lookup(extension).and_then(|ext| {
            let registered = ext.is_registered(std::time::Instant::now());
            registered.then(|| ext.binding.map(|b| b.address)).flatten()
        });
        let Some(contact) = contact else {
            info!(%extension, "destination not registered, diverting to voicemail");
            return InternalRouteOutcome::Divert;
        };

        let to_uri = format!("sip:{extension}@{}", self.local_address);
        let from_uri = format!("sip:{}@{}", call.from, self.local_address);
        let ringing = Self::provisional_response(original_request, StatusCode::RINGING).serialize();
        let socket = self.socket.clone();
        let on_provisional = move |resp: &SipMessage| {
            if resp.status_code() != Some(StatusCode::RINGING.0) {
                return;
            }
            let socket = socket.clone();
            let bytes = ringing.clone();
            tokio::spawn(async move {
                let _ = socket.send_to(&bytes, caller_source).await;
            });
        };

        let outcome = client::invite(
            &self.socket,
            &self.transactions,
            contact,
            &self.local_address,
            &call.id,
            &from_uri,
            &to_uri,
            offer_body,
            self.no_answer_timeout,
            on_provisional,
        )
        .await;

        match outcome {
            InviteOutcome::Answered(_) => {
                info!(call_id = %call.id, %extension, %contact, "second leg answered, bridging call");
                InternalRouteOutcome::Bridged
            }
            InviteOutcome::Rejected(resp) => {
                info!(call_id = %call.id, %extension, code = resp.status_code().unwrap_or(0), "second leg rejected, diverting to voicemail");
                InternalRouteOutcome::Divert
            }
            InviteOutcome::TimedOut => {
                info!(call_id = %call.id, %extension, "second leg no-answer timeout, diverting to voicemail");
                InternalRouteOutcome::Divert
            }
        }
    }

    /// Send a dialog-less provisional response straight to the caller,
    /// bypassing the transaction table's retransmitted-final-response
    /// path: provisional responses are sent once and never retransmitted.
    async fn send_to_caller(&self, request: &SipMessage, caller_source: SocketAddr, status: StatusCode) {
        let response = Self::provisional_response(request, status);
        if let Err(e) = self.socket.send_to(&response.serialize(), caller_source).await {
            warn!(%caller_source, error = %e, "failed to send provisional response");
        }
    }

    /// A response carrying the dialog-identifying headers copied
    /// verbatim off `request` (Via, From, To, Call-ID, CSeq), same
    /// fields `PbxHandler::base_response` copies for final responses.
    fn provisional_response(request: &SipMessage, status: StatusCode) -> SipMessage {
        let mut response = SipMessage::response_default(status);
        for via in request.headers_all("via") {
            response = response.with_header("Via", via);
        }
        if let Some(from) = request.header("from") {
            response = response.with_header("From", from);
        }
        if let Some(to) = request.header("to") {
            response = response.with_header("To", to);
        }
        if let Some(call_id) = request.header("call-id") {
            response = response.with_header("Call-ID", call_id);
        }
        if let Some(cseq) = request.header("cseq") {
            response = response.with_header("CSeq", cseq);
        }
        response
    }

    /// No-answer divert (§4.10): play the mailbox greeting, beep, and
    /// record the caller's leg until `#` or hangup. Called once the
    /// caller's own 200 OK has already gone out, so its RTP leg exists
    /// to play and record against.
    pub async fn divert_to_voicemail(&self, call: &Call, extension: &str, caller_rtp: std::net::SocketAddr) {
        self.call_manager.connect(&call.id).ok();
        let Some(entry) = self.relay.entry(&call.id) else {
            warn!(call_id = %call.id, "no relay entry for voicemail divert");
            self.call_manager.end(&call.id);
            return;
        };
        entry.stop_forwarding();
        let player = Player::new(entry.socket().clone(), caller_rtp, rand::random(), self.rtp_payload_type);
        let recorder = Recorder::new(entry.socket().clone());

        let greeting = self.voicemail_sink.get_greeting(extension).await.ok().flatten();
        let greeting_frames: Vec<bytes::Bytes> = greeting
            .map(|bytes| bytes.chunks(pbx_rtp::packet::SAMPLES_PER_PACKET_8KHZ as usize).map(bytes::Bytes::copy_from_slice).collect())
            .unwrap_or_default();
        if !greeting_frames.is_empty() {
            let _ = player.play_frames(&greeting_frames).await;
        } else if let Ok(beep) = self.prompts.resolve(pbx_media::prompts::BEEP) {
            let frames: Vec<bytes::Bytes> = beep.chunks(pbx_rtp::packet::SAMPLES_PER_PACKET_8KHZ as usize).map(bytes::Bytes::copy_from_slice).collect();
            let _ = player.play_frames(&frames).await;
        }

        let recorder = Arc::new(recorder);
        let reader_recorder = recorder.clone();
        let reader = tokio::spawn(async move {
            loop {
                if reader_recorder.recv_once().await.is_err() {
                    return;
                }
            }
        });

        let mut info_digits = self.call_manager.take_dtmf_receiver(&call.id);
        let mut detector = pbx_rtp::dtmf::StreamDtmfDetector::new();
        let max_record = Duration::from_secs(self.max_record_seconds);
        let start = std::time::Instant::now();
        loop {
            if start.elapsed() >= max_record {
                info!(call_id = %call.id, "no-answer recording hit max_record_seconds");
                break;
            }
            tokio::select! {
                digit = async {
                    match &mut info_digits {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if digit == Some('#') {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    // Unlike the IVR's recorder (cleared between digits), this
                    // buffer accumulates the whole message, so detection looks
                    // at a trailing window instead of the ever-growing prefix.
                    let tail = recorder.snapshot().await;
                    let window = pbx_rtp::dtmf::SAMPLES_PER_FRAME;
                    if tail.len() >= window {
                        let recent = &tail[tail.len() - window..];
                        let samples: Vec<f64> = recent.iter().map(|&b| pbx_rtp::law::ulaw_decode(b) as f64 / 32768.0).collect();
                        if detector.push_frame(&samples) == Some('#') {
                            break;
                        }
                    }
                }
            }
        }
        reader.abort();

        let payload = recorder.snapshot().await;
        let duration_seconds = start.elapsed().as_secs() as u32;
        match pbx_media::wav::write_wav(pbx_media::wav::SampleFormat::MuLaw, pbx_media::wav::SAMPLE_RATE_HZ, &payload) {
            Ok(wav) => match self.voicemail_sink.save_message(extension, &call.from, wav, duration_seconds).await {
                Ok(id) => info!(call_id = %call.id, %extension, %id, duration_seconds, "no-answer voicemail deposited"),
                Err(e) => warn!(call_id = %call.id, error = %e, "failed to save no-answer voicemail"),
            },
            Err(e) => warn!(call_id = %call.id, error = %e, "failed to wrap no-answer recording as WAV"),
        }

        self.cdr.end_record(call, Disposition::VoicemailDeposit).await;
        self.call_manager.end(&call.id);
    }

}

fn to_bool_watch(state: Option<watch::Receiver<CallState>>) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    if let Some(mut state) = state {
        tokio::spawn(async move {
            loop {
                if *state.borrow() == CallState::Ended {
                    let _ = tx.send(true);
                    return;
                }
                if state.changed().await.is_err() {
                    let _ = tx.send(true);
                    return;
                }
            }
        });
    } else {
        let _ = tx.send(true);
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_router() -> Router {
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_socket.set_nonblocking(true).unwrap();
        let socket = Arc::new(UdpSocket::from_std(std_socket).unwrap());
        Router::new(
            Arc::new(CallManager::new()),
            Arc::new(Registrar::new(3600)),
            Arc::new(RtpRelay::new("127.0.0.1".parse().unwrap(), 19_000, 19_010, pbx_rtp::relay::DEFAULT_IDLE_TIMEOUT)),
            Arc::new(pbx_voicemail::sink::InMemorySink::default()),
            Arc::new(PromptResolver::new(None)),
            Arc::new(crate::cdr::NullCdrSink),
            socket,
            Arc::new(TransactionTable::new()),
            "127.0.0.1:5060".to_string(),
            r"^\d{4}$",
            Duration::from_secs(25),
            120,
            Duration::from_millis(500),
            0,
        )
    }

    #[tokio::test]
    async fn classifies_voicemail_access() {
        assert_eq!(test_router().classify("*1001"), Destination::VoicemailAccess("1001".to_string()));
    }

    #[tokio::test]
    async fn classifies_emergency() {
        assert_eq!(test_router().classify("911"), Destination::Emergency);
        assert_eq!(test_router().classify("9911"), Destination::Emergency);
    }

    #[tokio::test]
    async fn classifies_auto_attendant() {
        assert_eq!(test_router().classify("0"), Destination::AutoAttendant);
    }

    #[tokio::test]
    async fn classifies_parking_and_queue() {
        assert_eq!(test_router().classify("70"), Destination::Parking("70".to_string()));
        assert_eq!(test_router().classify("8123"), Destination::Queue("8123".to_string()));
    }

    #[tokio::test]
    async fn classifies_internal_and_rejects_others() {
        assert_eq!(test_router().classify("1001"), Destination::Internal("1001".to_string()));
        assert_eq!(test_router().classify("12"), Destination::NotFound);
    }
}
