//! Drives an [`IvrSession`] against real audio I/O: a `select!` over
//! the DTMF-INFO channel, in-band detection on the Recorder's tail,
//! the inactivity timer, and the Call's cancellation signal (Design
//! Notes §9, replacing the source's `sleep(0.1)` poll loop).

use std::sync::Arc;
use std::time::Duration;

use pbx_media::prompts::PromptResolver;
use pbx_rtp::dtmf::StreamDtmfDetector;
use pbx_rtp::player::{Player, Recorder};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::ivr::{persist_recording, DigitSource, IvrAction, IvrEvent, IvrSession, IvrState};
use crate::sink::VoicemailSink;

const DEFAULT_INBAND_DEBOUNCE: Duration = Duration::from_millis(500);
const TICK: Duration = Duration::from_millis(100);

/// Everything the driver needs to actually execute [`IvrAction`]s.
pub struct IvrDriver {
    pub session: IvrSession,
    pub player: Arc<Player>,
    pub recorder: Arc<Recorder>,
    pub prompts: Arc<PromptResolver>,
    pub sink: Arc<dyn VoicemailSink>,
    pub extension: String,
    pub caller_id: String,
    pub info_digits: mpsc::Receiver<char>,
    pub call_ended: watch::Receiver<bool>,
    detector: StreamDtmfDetector,
    recording_started: Option<std::time::Instant>,
    last_inband_digit_at: Option<std::time::Instant>,
    last_activity_at: std::time::Instant,
    max_record_time: Duration,
    inband_debounce: Duration,
}

impl IvrDriver {
    pub fn new(
        session: IvrSession,
        player: Arc<Player>,
        recorder: Arc<Recorder>,
        prompts: Arc<PromptResolver>,
        sink: Arc<dyn VoicemailSink>,
        extension: String,
        caller_id: String,
        info_digits: mpsc::Receiver<char>,
        call_ended: watch::Receiver<bool>,
    ) -> Self {
        Self::with_timing(
            session, player, recorder, prompts, sink, extension, caller_id, info_digits, call_ended,
            crate::ivr::MAX_RECORD_TIME, DEFAULT_INBAND_DEBOUNCE,
        )
    }

    /// Same as [`IvrDriver::new`] but with `features.voicemail.max_record_seconds`
    /// and `features.dtmf.debounce_ms` overridden from configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn with_timing(
        session: IvrSession,
        player: Arc<Player>,
        recorder: Arc<Recorder>,
        prompts: Arc<PromptResolver>,
        sink: Arc<dyn VoicemailSink>,
        extension: String,
        caller_id: String,
        info_digits: mpsc::Receiver<char>,
        call_ended: watch::Receiver<bool>,
        max_record_time: Duration,
        inband_debounce: Duration,
    ) -> Self {
        IvrDriver {
            session,
            player,
            recorder,
            prompts,
            sink,
            extension,
            caller_id,
            info_digits,
            call_ended,
            detector: StreamDtmfDetector::new(),
            recording_started: None,
            last_inband_digit_at: None,
            last_activity_at: std::time::Instant::now(),
            max_record_time,
            inband_debounce,
        }
    }

    /// Run until the session reaches `Goodbye` and hangs up, or the
    /// Call is cancelled out from under it.
    pub async fn run(&mut self) {
        // Welcome's only transition ignores the triggering event.
        let initial = self.session.apply(IvrEvent::PromptDone);
        self.execute(initial).await;

        loop {
            if *self.call_ended.borrow() {
                return;
            }
            if self.session.state == IvrState::Goodbye {
                return;
            }
            if self.last_activity_at.elapsed() >= crate::ivr::INACTIVITY_TIMEOUT {
                let actions = self.session.apply(IvrEvent::SilenceTimeout);
                self.execute(actions).await;
                continue;
            }

            tokio::select! {
                _ = self.call_ended.changed() => {
                    if *self.call_ended.borrow() {
                        info!(extension = %self.extension, "IVR observing call end, stopping");
                        return;
                    }
                }
                digit = self.info_digits.recv() => {
                    let Some(digit) = digit else { return };
                    self.handle_digit(DigitSource::SipInfo(digit)).await;
                }
                _ = tokio::time::sleep(TICK) => {
                    self.poll_inband().await;
                }
            }
        }
    }

    async fn handle_digit(&mut self, source: DigitSource) {
        self.last_activity_at = std::time::Instant::now();
        self.recorder.clear().await;
        let actions = self.session.apply(IvrEvent::Digit(source.digit()));
        self.execute(actions).await;
    }

    async fn poll_inband(&mut self) {
        if !matches!(self.session.state, IvrState::Listening | IvrState::RecordingGreeting) {
            return;
        }
        if let Some(started) = self.recording_started {
            if started.elapsed() >= self.max_record_time {
                let actions = self.session.apply(IvrEvent::MaxRecordTime);
                self.finish_recording().await;
                self.execute(actions).await;
                return;
            }
        }

        let tail = self.recorder.snapshot().await;
        if tail.len() < pbx_rtp::dtmf::MIN_DETECTION_BYTES {
            return;
        }
        let samples: Vec<f64> = tail.iter().map(|&b| pbx_rtp::law::ulaw_decode(b) as f64 / 32768.0).collect();
        if let Some(digit) = self.detector.push_frame(&samples) {
            if let Some(last) = self.last_inband_digit_at {
                if last.elapsed() < self.inband_debounce {
                    return;
                }
            }
            self.last_inband_digit_at = Some(std::time::Instant::now());
            self.last_activity_at = std::time::Instant::now();
            let actions = self.session.apply(IvrEvent::Digit(digit));
            if digit == '#' {
                self.finish_recording().await;
            }
            self.recorder.clear().await;
            self.execute(actions).await;
        }
    }

    async fn finish_recording(&mut self) {
        let duration = self.recording_started.map(|t| t.elapsed().as_secs() as u32).unwrap_or(0);
        let payload = self.recorder.snapshot().await;
        self.recorder.clear().await;
        self.recording_started = None;
        let wav = match pbx_media::wav::write_wav(pbx_media::wav::SampleFormat::MuLaw, pbx_media::wav::SAMPLE_RATE_HZ, &payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(extension = %self.extension, error = %e, "failed to wrap recording as WAV");
                return;
            }
        };
        persist_recording(self.sink.as_ref(), &self.extension, &self.caller_id, wav, duration).await;
    }

    /// Execute `actions` in order. Some actions (`FetchMessages`) need
    /// I/O the pure state machine can't do itself; their result is fed
    /// back in as an event, and any actions *that* produces are run
    /// before moving on to the rest of the original list — otherwise a
    /// `PlayMessage` from the fetch would run after a `main_menu` prompt
    /// queued behind it.
    async fn execute(&mut self, actions: Vec<IvrAction>) {
        let mut queue: std::collections::VecDeque<IvrAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                IvrAction::PlayPrompt { name } => {
                    if let Ok(payload) = self.prompts.resolve(name) {
                        let frames = to_20ms_frames(&payload);
                        let _ = self.player.play_frames(&frames).await;
                    }
                }
                IvrAction::PlayMessage { path, .. } => {
                    if let Ok(bytes) = std::fs::read(&path) {
                        if let Ok(audio) = pbx_media::wav::read_wav(&bytes) {
                            let frames = to_20ms_frames(&audio.payload);
                            let _ = self.player.play_frames(&frames).await;
                        }
                    }
                    let followup = self.session.apply(IvrEvent::PromptDone);
                    for action in followup.into_iter().rev() {
                        queue.push_front(action);
                    }
                }
                IvrAction::PlayGreeting { bytes } => {
                    let frames = to_20ms_frames(&bytes);
                    let _ = self.player.play_frames(&frames).await;
                }
                IvrAction::StartRecording => {
                    self.recorder.clear().await;
                    self.recording_started = Some(std::time::Instant::now());
                }
                IvrAction::StopRecording => {
                    self.finish_recording().await;
                }
                IvrAction::CollectDigit => {}
                IvrAction::Hangup => {}
                IvrAction::FetchMessages => {
                    let messages = match self.sink.get_messages(&self.extension, true).await {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!(extension = %self.extension, error = %e, "failed to fetch mailbox, returning to main menu");
                            Vec::new()
                        }
                    };
                    let followup = self.session.apply(IvrEvent::MessagesLoaded(messages));
                    for action in followup.into_iter().rev() {
                        queue.push_front(action);
                    }
                }
                IvrAction::MarkListened { id } => {
                    if let Err(e) = self.sink.mark_listened(&self.extension, &id).await {
                        warn!(extension = %self.extension, %id, error = %e, "failed to mark message listened");
                    }
                }
                IvrAction::MarkUnread { id } => {
                    if let Err(e) = self.sink.mark_unread(&self.extension, &id).await {
                        warn!(extension = %self.extension, %id, error = %e, "failed to mark message unread");
                    }
                }
                IvrAction::DeleteMessage { id } => {
                    if let Err(e) = self.sink.delete_message(&self.extension, &id).await {
                        warn!(extension = %self.extension, %id, error = %e, "failed to delete message");
                    }
                }
            }
        }
    }
}

fn to_20ms_frames(payload: &[u8]) -> Vec<bytes::Bytes> {
    payload.chunks(pbx_rtp::packet::SAMPLES_PER_PACKET_8KHZ as usize).map(bytes::Bytes::copy_from_slice).collect()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use pbx_rtp::packet::{RtpHeader, RtpPacket};
    use tokio::net::UdpSocket;

    use super::*;
    use crate::ivr::IvrState;
    use crate::sink::InMemorySink;

    fn tone_datagram(digit: char, duration_ms: u32, seq: u16) -> Vec<u8> {
        let payload = pbx_media::tone::dtmf_digit_mulaw(digit, duration_ms);
        let packet = RtpPacket {
            header: RtpHeader {
                version: 2, padding: false, extension: false, marker: false,
                payload_type: 0, sequence_number: seq, timestamp: 0, ssrc: 42, csrc: vec![],
            },
            payload: bytes::Bytes::from(payload),
        };
        packet.serialize().to_vec()
    }

    async fn send_tone(peer: &UdpSocket, dest: SocketAddr, digit: char, seq: u16) {
        let datagram = tone_datagram(digit, 300, seq);
        peer.send_to(&datagram, dest).await.unwrap();
    }

    async fn test_driver(inband_debounce: Duration) -> (IvrDriver, UdpSocket, SocketAddr, Arc<Recorder>) {
        let driver_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let driver_addr = driver_socket.local_addr().unwrap();

        let recorder = Arc::new(Recorder::new(driver_socket.clone()));
        let player = Arc::new(Player::new(driver_socket.clone(), peer_socket.local_addr().unwrap(), 1, 0));
        let (_info_tx, info_rx) = mpsc::channel(4);
        let (_ended_tx, ended_rx) = watch::channel(false);

        let mut session = IvrSession::new("0000");
        session.state = IvrState::Listening;

        let driver = IvrDriver::with_timing(
            session,
            player,
            recorder.clone(),
            Arc::new(PromptResolver::new(None)),
            Arc::new(InMemorySink::default()),
            "1001".to_string(),
            "2001".to_string(),
            info_rx,
            ended_rx,
            Duration::from_secs(120),
            inband_debounce,
        );
        (driver, peer_socket, driver_addr, recorder)
    }

    #[tokio::test]
    async fn inband_digit_is_reported_and_clears_the_recorder() {
        let (mut driver, peer, addr, recorder) = test_driver(Duration::from_millis(200)).await;

        send_tone(&peer, addr, '1', 1).await;
        recorder.recv_once().await.unwrap();
        driver.poll_inband().await;

        assert!(driver.last_inband_digit_at.is_some());
        assert_eq!(recorder.len().await, 0, "buffer cleared once a digit is accepted");
    }

    #[tokio::test]
    async fn second_inband_digit_within_debounce_window_is_suppressed() {
        let (mut driver, peer, addr, recorder) = test_driver(Duration::from_millis(300)).await;

        send_tone(&peer, addr, '1', 1).await;
        recorder.recv_once().await.unwrap();
        driver.poll_inband().await;
        let first_seen = driver.last_inband_digit_at.expect("first digit accepted");

        // A different digit arrives immediately after: still inside the
        // debounce window, so it must not update state or clear the buffer.
        send_tone(&peer, addr, '2', 2).await;
        recorder.recv_once().await.unwrap();
        driver.poll_inband().await;

        assert_eq!(driver.last_inband_digit_at, Some(first_seen), "suppressed digit must not move the debounce clock");
        assert!(recorder.len().await > 0, "suppressed digit's audio is left in the buffer");
    }

    #[tokio::test]
    async fn inband_digit_after_debounce_window_elapses_is_accepted() {
        let debounce = Duration::from_millis(80);
        let (mut driver, peer, addr, recorder) = test_driver(debounce).await;

        send_tone(&peer, addr, '1', 1).await;
        recorder.recv_once().await.unwrap();
        driver.poll_inband().await;
        let first_seen = driver.last_inband_digit_at.expect("first digit accepted");

        tokio::time::sleep(debounce + Duration::from_millis(50)).await;
        recorder.clear().await;

        send_tone(&peer, addr, '2', 2).await;
        recorder.recv_once().await.unwrap();
        driver.poll_inband().await;

        let second_seen = driver.last_inband_digit_at.expect("second digit accepted after window elapses");
        assert!(second_seen > first_seen);
        assert_eq!(recorder.len().await, 0);
    }

    #[tokio::test]
    async fn listening_flow_plays_and_marks_the_message_listened() {
        let driver_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let recorder = Arc::new(Recorder::new(driver_socket.clone()));
        let player = Arc::new(Player::new(driver_socket.clone(), peer_socket.local_addr().unwrap(), 1, 0));
        let (_info_tx, info_rx) = mpsc::channel(4);
        let (_ended_tx, ended_rx) = watch::channel(false);

        let sink = Arc::new(InMemorySink::default());
        sink.save_message("1001", "2001", vec![0; 10], 3).await.unwrap();

        let mut session = IvrSession::new("0000");
        session.state = IvrState::MainMenu;

        let mut driver = IvrDriver::with_timing(
            session, player, recorder, Arc::new(PromptResolver::new(None)), sink.clone(),
            "1001".to_string(), "2001".to_string(), info_rx, ended_rx,
            Duration::from_secs(120), Duration::from_millis(500),
        );

        driver.handle_digit(DigitSource::SipInfo('1')).await;

        assert_eq!(driver.session.state, IvrState::MainMenu, "returns to MainMenu once the message finishes playing");
        assert!(sink.get_messages("1001", true).await.unwrap().is_empty(), "message marked listened");
        assert_eq!(sink.get_messages("1001", false).await.unwrap().len(), 1, "message not deleted, just read");
    }

    #[tokio::test]
    async fn listening_flow_with_no_messages_plays_fallback_prompt() {
        let driver_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let recorder = Arc::new(Recorder::new(driver_socket.clone()));
        let player = Arc::new(Player::new(driver_socket.clone(), peer_socket.local_addr().unwrap(), 1, 0));
        let (_info_tx, info_rx) = mpsc::channel(4);
        let (_ended_tx, ended_rx) = watch::channel(false);

        let mut session = IvrSession::new("0000");
        session.state = IvrState::MainMenu;

        let mut driver = IvrDriver::with_timing(
            session, player, recorder, Arc::new(PromptResolver::new(None)), Arc::new(InMemorySink::default()),
            "1001".to_string(), "2001".to_string(), info_rx, ended_rx,
            Duration::from_secs(120), Duration::from_millis(500),
        );

        driver.handle_digit(DigitSource::SipInfo('1')).await;
        assert_eq!(driver.session.state, IvrState::MainMenu);
    }
}
