//! Wires `CallManager` + `Router` + `Registrar` + `FailureTracker` into
//! a [`SipRequestHandler`] (§4.7's method table).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use pbx_dialog::auth::{verify_response, DigestCredentials, FailureTracker};
use pbx_dialog::dialog::{Dialog, DialogKey, DialogState, DialogTable};
use pbx_dialog::handler::{HandledRequest, SipRequestHandler};
use pbx_registrar::registrar::{parse_expires, Registrar};
use pbx_rtp::relay::RtpRelay;
use pbx_sip::message::SipMessage;
use pbx_sip::sdp::{build_answer, AnswerParams, SdpSession};
use pbx_sip::status::StatusCode;
use pbx_sip::uri::SipUri;
use tracing::{debug, warn};

use crate::call::CallManager;
use crate::cdr::{CdrSink, Disposition};
use crate::external::ExtensionRegistry;
use crate::router::{Destination, InternalRouteOutcome, Router};

/// The false-BYE quirk window (§4.7): a BYE arriving this soon after a
/// voicemail-access answer is assumed to be a handset firmware glitch.
const FALSE_BYE_WINDOW: chrono::Duration = chrono::Duration::seconds(2);

pub struct PbxHandler {
    pub call_manager: Arc<CallManager>,
    pub router: Arc<Router>,
    pub registrar: Arc<Registrar>,
    pub extensions: Arc<dyn ExtensionRegistry>,
    pub relay: Arc<RtpRelay>,
    pub dialogs: Arc<DialogTable>,
    pub cdr: Arc<dyn CdrSink>,
    pub failures: Arc<FailureTracker>,
    pub realm: String,
    pub local_address: String,
    pub dtmf_payload_type: u8,
    pub ilbc_mode: u8,
}

impl PbxHandler {
    /// Extract the user-part the dialplan classifies on, from a
    /// Request-URI such as `sip:1001@pbx.example.com`.
    fn destination_user(request: &SipMessage) -> Option<String> {
        let uri = request.request_uri()?;
        SipUri::parse(uri).ok()?.user
    }

    fn from_user(request: &SipMessage) -> Option<String> {
        let from = request.header("from")?;
        let uri_start = from.find("sip:")?;
        let uri_end = from[uri_start..].find(|c| c == '>' || c == ';').map(|i| uri_start + i).unwrap_or(from.len());
        SipUri::parse(&from[uri_start..uri_end]).ok()?.user
    }

    fn call_id(request: &SipMessage) -> Option<&str> {
        request.header("call-id")
    }

    /// A response carrying the dialog-identifying headers copied
    /// verbatim from the request (Via, From, Call-ID, CSeq); the
    /// caller adds whatever's specific to the method.
    fn base_response(request: &SipMessage, status: StatusCode) -> SipMessage {
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

    /// Same as [`Self::base_response`], but stamps a fresh local tag
    /// onto `To` (dialog-establishing responses: 200 OK to INVITE).
    fn dialog_establishing_response(request: &SipMessage, status: StatusCode, local_tag: &str) -> SipMessage {
        let response = Self::base_response(request, status);
        let to = request.header("to").unwrap_or_default();
        let to = if to.contains("tag=") { to.to_string() } else { format!("{to};tag={local_tag}") };
        let mut headers = response.headers.clone();
        headers.set("To", to);
        SipMessage { headers, ..response }
    }

    fn challenge(&self, request: &SipMessage, status: StatusCode) -> SipMessage {
        let nonce = pbx_dialog::auth::generate_nonce();
        Self::base_response(request, status)
            .with_header("WWW-Authenticate", format!(r#"Digest realm="{}", nonce="{}", algorithm=MD5"#, self.realm, nonce))
    }

    /// Verify the `Authorization` header's digest response against the
    /// claimed user's stored HA1.
    fn verify_auth(&self, request: &SipMessage, method: &str, uri: &str) -> Option<bool> {
        let creds = DigestCredentials::parse(request.header("authorization")?)?;
        let ha1 = self.registrar.ha1_for(&creds.username)?;
        Some(verify_response(&ha1, &creds.nonce, method, uri, &creds.response))
    }
}

#[async_trait]
impl SipRequestHandler for PbxHandler {
    async fn handle_register(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest {
        if self.failures.is_blocked(source) {
            return HandledRequest::reply(Self::base_response(request, StatusCode::FORBIDDEN));
        }

        let Some(number) = Self::destination_user(request) else {
            return HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST));
        };
        let uri = request.request_uri().unwrap_or_default();

        match self.verify_auth(request, "REGISTER", uri) {
            Some(true) => {}
            Some(false) | None => {
                if self.failures.record_failure(source) {
                    warn!(%source, %number, "too many failed REGISTER attempts, blocking source");
                    return HandledRequest::reply(Self::base_response(request, StatusCode::FORBIDDEN));
                }
                return HandledRequest::reply(self.challenge(request, StatusCode::UNAUTHORIZED));
            }
        }
        self.failures.clear(source);

        let contact = request.header("contact");
        let expires = parse_expires(request.header("expires"), contact).unwrap_or(3600);
        match self.registrar.register(&number, source, expires) {
            Ok(outcome) => {
                let mut response = Self::base_response(request, StatusCode::OK);
                if let Some(addr) = outcome.contact_address {
                    response = response.with_header("Contact", format!("<sip:{number}@{addr}>;expires={}", outcome.granted_expires));
                }
                response = response.with_header("Expires", outcome.granted_expires.to_string());
                HandledRequest::reply(response)
            }
            Err(e) => {
                debug!(%source, %number, error = %e, "REGISTER rejected");
                HandledRequest::reply(Self::base_response(request, StatusCode::NOT_FOUND))
            }
        }
    }

    async fn handle_invite(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest {
        let Some(destination) = Self::destination_user(request) else {
            return HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST));
        };
        let Some(call_id) = Self::call_id(request).map(|s| s.to_string()) else {
            return HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST));
        };

        match self.verify_auth(request, "INVITE", request.request_uri().unwrap_or_default()) {
            Some(true) => {}
            Some(false) | None if request.header("authorization").is_some() => {
                if self.failures.record_failure(source) {
                    return HandledRequest::reply(Self::base_response(request, StatusCode::FORBIDDEN));
                }
                return HandledRequest::reply(self.challenge(request, StatusCode::PROXY_AUTH_REQUIRED));
            }
            _ => {
                if self.failures.is_blocked(source) {
                    return HandledRequest::reply(Self::base_response(request, StatusCode::FORBIDDEN));
                }
                return HandledRequest::reply(self.challenge(request, StatusCode::PROXY_AUTH_REQUIRED));
            }
        }
        self.failures.clear(source);

        let from = Self::from_user(request).unwrap_or_else(|| source.to_string());

        let offer = match SdpSession::parse(&request.body) {
            Ok(sdp) => sdp,
            Err(e) => {
                debug!(%call_id, error = %e, "INVITE with unparseable SDP");
                return HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST));
            }
        };
        let caller_rtp: SocketAddr = match format!("{}:{}", offer.connection_address, offer.audio_port).parse() {
            Ok(addr) => addr,
            Err(_) => return HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST)),
        };

        let (rtp_port, _rtcp_port) = match self.relay.allocate(&call_id).await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(%call_id, error = %e, "failed to allocate RTP relay entry");
                return HandledRequest::reply(Self::base_response(request, StatusCode::SERVICE_UNAVAILABLE));
            }
        };

        let call = self.call_manager.create(&call_id, &from, &destination);
        self.cdr.start_record(&call).await;

        let mut codec_names = std::collections::BTreeMap::new();
        codec_names.insert(0u8, ("PCMU".to_string(), 8000u32));
        codec_names.insert(8u8, ("PCMA".to_string(), 8000u32));
        let answer_params = AnswerParams {
            local_address: &self.local_address,
            local_port: rtp_port,
            session_id: &call_id,
            supported: &[0, 8],
            codec_names: &codec_names,
            dtmf_payload_type: self.dtmf_payload_type,
            ilbc_mode: self.ilbc_mode,
        };
        let (_selected, body) = build_answer(&offer, &answer_params);
        let local_tag = uuid::Uuid::new_v4().to_string();

        let ok_response = |dialogs: &DialogTable| {
            let response = Self::dialog_establishing_response(request, StatusCode::OK, &local_tag)
                .with_header("Content-Type", "application/sdp")
                .with_body(body.clone());
            dialogs.insert(dialog_of(request, &local_tag));
            response
        };

        match self.router.classify(&destination) {
            Destination::VoicemailAccess(extension) => {
                let stored_pin = self.extensions.get(&extension).await.map(|e| e.mailbox_pin).unwrap_or_else(|| "0000".to_string());
                self.call_manager.set_voicemail_access(&call_id);
                let router = self.router.clone();
                let call_id_for_task = call_id.clone();
                tokio::spawn(async move {
                    if let Some(call) = router.call_manager.get(&call_id_for_task) {
                        router.start_voicemail_access(&call, &extension, &stored_pin, caller_rtp).await;
                    }
                });
                HandledRequest::reply(ok_response(&self.dialogs))
            }
            Destination::Emergency | Destination::AutoAttendant | Destination::Parking(_) | Destination::Queue(_) => {
                // No attendant/parking/queue application logic lives
                // here yet (§4.10's other Non-goals); these destinations
                // just ring through as a plain internal call would.
                self.call_manager.ring(&call_id).ok();
                HandledRequest::reply(ok_response(&self.dialogs))
            }
            Destination::Internal(extension) => {
                let outcome = match self.call_manager.get(&call_id) {
                    Some(call) => self.router.route_internal(&call, &extension, source, request, body.clone()).await,
                    None => return HandledRequest::reply(Self::base_response(request, StatusCode::NOT_FOUND)),
                };
                let response = ok_response(&self.dialogs);
                if outcome == InternalRouteOutcome::Divert {
                    let router = self.router.clone();
                    let call_id_for_task = call_id.clone();
                    tokio::spawn(async move {
                        if let Some(call) = router.call_manager.get(&call_id_for_task) {
                            router.divert_to_voicemail(&call, &extension, caller_rtp).await;
                        }
                    });
                }
                HandledRequest::reply(response)
            }
            Destination::NotFound => {
                self.call_manager.end(&call_id);
                self.relay.release(&call_id);
                HandledRequest::reply(Self::base_response(request, StatusCode::NOT_FOUND))
            }
        }
    }

    async fn handle_reinvite(&self, request: &SipMessage, _source: SocketAddr) -> HandledRequest {
        // Hold/resume renegotiation: answer with the same codec set.
        // Media-direction bookkeeping lives in the Call Manager's
        // hold()/resume(), driven by whatever signaling this PBX
        // itself emits, not by SDP `a=sendonly` inspection here.
        let Some(call_id) = Self::call_id(request) else {
            return HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST));
        };
        match SdpSession::parse(&request.body) {
            Ok(offer) => {
                let mut codec_names = std::collections::BTreeMap::new();
                codec_names.insert(0u8, ("PCMU".to_string(), 8000u32));
                codec_names.insert(8u8, ("PCMA".to_string(), 8000u32));
                let rtp_port = self.relay.entry(call_id).map(|e| e.rtp_port).unwrap_or(offer.audio_port);
                let params = AnswerParams {
                    local_address: &self.local_address,
                    local_port: rtp_port,
                    session_id: call_id,
                    supported: &[0, 8],
                    codec_names: &codec_names,
                    dtmf_payload_type: self.dtmf_payload_type,
                    ilbc_mode: self.ilbc_mode,
                };
                let (_selected, body) = build_answer(&offer, &params);
                HandledRequest::reply(
                    Self::base_response(request, StatusCode::OK).with_header("Content-Type", "application/sdp").with_body(body),
                )
            }
            Err(_) => HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST)),
        }
    }

    async fn handle_ack(&self, request: &SipMessage, _source: SocketAddr) {
        if let Some(call_id) = Self::call_id(request) {
            self.call_manager.connect(call_id).ok();
        }
    }

    async fn handle_bye(&self, request: &SipMessage, _source: SocketAddr) -> HandledRequest {
        let Some(call_id) = Self::call_id(request) else {
            return HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST));
        };
        let Some(call) = self.call_manager.get(call_id) else {
            return HandledRequest::reply(Self::base_response(request, StatusCode::OK));
        };

        if call.voicemail_access && !call.first_bye_ignored {
            if let Some(answer_time) = call.answer_time {
                if chrono::Utc::now() - answer_time < FALSE_BYE_WINDOW {
                    self.call_manager.ignore_first_bye(call_id);
                    debug!(%call_id, "ignoring spurious BYE immediately after voicemail-access answer");
                    return HandledRequest::reply(Self::base_response(request, StatusCode::OK));
                }
            }
        }

        self.cdr.end_record(&call, Disposition::Answered).await;
        self.call_manager.end(call_id);
        self.relay.release(call_id);
        HandledRequest::reply_and_terminate(Self::base_response(request, StatusCode::OK))
    }

    async fn handle_cancel(&self, request: &SipMessage, _source: SocketAddr) -> HandledRequest {
        if let Some(call_id) = Self::call_id(request) {
            self.call_manager.end(call_id);
            self.relay.release(call_id);
        }
        HandledRequest::reply_and_terminate(Self::base_response(request, StatusCode::OK))
    }

    async fn handle_info(&self, request: &SipMessage, _source: SocketAddr) -> HandledRequest {
        let Some(call_id) = Self::call_id(request) else {
            return HandledRequest::reply(Self::base_response(request, StatusCode::BAD_REQUEST));
        };
        let digit = std::str::from_utf8(&request.body).ok().and_then(parse_dtmf_signal);

        if self.call_manager.get(call_id).is_none() {
            debug!(%call_id, "INFO for a call that has already ended, phones buffer these after BYE");
            return HandledRequest::reply(Self::base_response(request, StatusCode::OK));
        }

        if let Some(digit) = digit {
            self.call_manager.push_dtmf(call_id, digit);
        }
        HandledRequest::reply(Self::base_response(request, StatusCode::OK))
    }

    async fn handle_options(&self, request: &SipMessage, _source: SocketAddr) -> HandledRequest {
        HandledRequest::reply(
            Self::base_response(request, StatusCode::OK).with_header("Allow", "REGISTER, INVITE, ACK, BYE, CANCEL, INFO, OPTIONS"),
        )
    }
}

/// `Signal=<digit>` out of an INFO body (application/dtmf-relay or
/// application/dtmf, §4.7).
fn parse_dtmf_signal(body: &str) -> Option<char> {
    body.lines().find_map(|line| line.trim().strip_prefix("Signal=")).and_then(|v| v.trim().chars().next())
}

fn dialog_of(request: &SipMessage, local_tag: &str) -> Dialog {
    let call_id = request.header("call-id").unwrap_or_default().to_string();
    let remote_tag = tag_of(request.header("from").unwrap_or_default()).unwrap_or_default();
    let remote_target = request.header("contact").unwrap_or_default().to_string();
    let mut dialog = Dialog::new(DialogKey::new(call_id, local_tag, remote_tag), remote_target);
    dialog.state = DialogState::Confirmed;
    dialog
}

fn tag_of(header_value: &str) -> Option<String> {
    header_value.split(';').find_map(|p| p.trim().strip_prefix("tag=")).map(|s| s.to_string())
}
