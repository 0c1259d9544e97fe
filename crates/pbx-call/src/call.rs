//! The Call Manager (§4.8): a concurrent map of call-id -> Call, the
//! sole writer of Call.state, plus a bounded history of ended calls.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::{CallError, CallResult};

const DTMF_QUEUE_CAPACITY: usize = 32;
const DEFAULT_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    Connected,
    Hold,
    Transferring,
    Ended,
}

impl CallState {
    fn name(self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::Calling => "Calling",
            CallState::Ringing => "Ringing",
            CallState::Connected => "Connected",
            CallState::Hold => "Hold",
            CallState::Transferring => "Transferring",
            CallState::Ended => "Ended",
        }
    }
}

/// A single call's state, plus the channels other tasks use to feed it
/// DTMF digits and observe its cancellation (§5: a `watch<CallState>`
/// per call is the cooperative-cancellation signal every suspension
/// point selects on).
#[derive(Clone)]
pub struct Call {
    pub id: String,
    pub from: String,
    pub to: String,
    pub state: CallState,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub voicemail_access: bool,
    pub first_bye_ignored: bool,
    pub rtp_port: Option<u16>,
    dtmf_tx: mpsc::Sender<char>,
    state_tx: Arc<watch::Sender<CallState>>,
}

impl Call {
    /// Duration so far: (end_time or now) - start_time (§4.8).
    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }

    pub fn state_watch(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state != CallState::Ended
    }
}

/// Concurrent call-id -> Call map. The sole writer of `Call.state`
/// (§4.8); callers only ever read through `get`/`active`/`for_extension`.
pub struct CallManager {
    calls: DashMap<String, Call>,
    dtmf_receivers: DashMap<String, Mutex<Option<mpsc::Receiver<char>>>>,
    history: Mutex<VecDeque<Call>>,
    history_limit: usize,
}

impl CallManager {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        CallManager {
            calls: DashMap::new(),
            dtmf_receivers: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit,
        }
    }

    /// `Idle --start--> Calling`. Allocates the call's DTMF channel and
    /// cancellation watch.
    pub fn create(&self, id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Call {
        let id = id.into();
        let (dtmf_tx, dtmf_rx) = mpsc::channel(DTMF_QUEUE_CAPACITY);
        let (state_tx, _state_rx) = watch::channel(CallState::Calling);
        let call = Call {
            id: id.clone(),
            from: from.into(),
            to: to.into(),
            state: CallState::Calling,
            start_time: Utc::now(),
            answer_time: None,
            end_time: None,
            voicemail_access: false,
            first_bye_ignored: false,
            rtp_port: None,
            dtmf_tx,
            state_tx: Arc::new(state_tx),
        };
        self.calls.insert(id.clone(), call.clone());
        self.dtmf_receivers.insert(id, Mutex::new(Some(dtmf_rx)));
        call
    }

    pub fn get(&self, id: &str) -> Option<Call> {
        self.calls.get(id).map(|c| c.clone())
    }

    /// Take the DTMF receiver for `id`, if it hasn't already been
    /// claimed (e.g. by an IVR driver or an INFO-relay task).
    pub fn take_dtmf_receiver(&self, id: &str) -> Option<mpsc::Receiver<char>> {
        self.dtmf_receivers.get(id).and_then(|slot| slot.lock().take())
    }

    /// Mark a call as a voicemail-access call (§4.10): enables the
    /// false-BYE-quirk tolerance in the SIP handler.
    pub fn set_voicemail_access(&self, id: &str) {
        if let Some(mut call) = self.calls.get_mut(id) {
            call.voicemail_access = true;
        }
    }

    /// Record that the handler has already absorbed one spurious BYE
    /// for this call (§4.7's false-BYE quirk), so a second one is
    /// treated as real.
    pub fn ignore_first_bye(&self, id: &str) {
        if let Some(mut call) = self.calls.get_mut(id) {
            call.first_bye_ignored = true;
        }
    }

    /// Append a DTMF digit to the call's queue (§4.7 INFO handling).
    /// Silently dropped if the call is gone or nobody is listening —
    /// both are valid states (§8: "INFO arriving after a call has ended
    /// is accepted ... and does not produce a warning").
    pub fn push_dtmf(&self, id: &str, digit: char) {
        let Some(call) = self.calls.get(id) else {
            debug!(call_id = id, %digit, "DTMF INFO for unknown/ended call, ignoring");
            return;
        };
        let _ = call.dtmf_tx.try_send(digit);
    }

    fn transition(&self, id: &str, expected: &[CallState], next: CallState) -> CallResult<Call> {
        let mut entry = self.calls.get_mut(id).ok_or_else(|| CallError::NotFound(id.to_string()))?;
        if !expected.contains(&entry.state) {
            return Err(CallError::InvalidTransition { call_id: id.to_string(), from: entry.state.name() });
        }
        entry.state = next;
        if next == CallState::Connected && entry.answer_time.is_none() {
            entry.answer_time = Some(Utc::now());
        }
        let _ = entry.state_tx.send(next);
        Ok(entry.clone())
    }

    /// `Calling --ring--> Ringing`.
    pub fn ring(&self, id: &str) -> CallResult<Call> {
        self.transition(id, &[CallState::Calling], CallState::Ringing)
    }

    /// `Ringing --connect--> Connected`.
    pub fn connect(&self, id: &str) -> CallResult<Call> {
        self.transition(id, &[CallState::Ringing, CallState::Calling], CallState::Connected)
    }

    /// `Connected --hold--> Hold`.
    pub fn hold(&self, id: &str) -> CallResult<Call> {
        self.transition(id, &[CallState::Connected], CallState::Hold)
    }

    /// `Hold --resume--> Connected`.
    pub fn resume(&self, id: &str) -> CallResult<Call> {
        self.transition(id, &[CallState::Hold], CallState::Connected)
    }

    /// `Connected --transfer--> Transferring`.
    pub fn begin_transfer(&self, id: &str) -> CallResult<Call> {
        self.transition(id, &[CallState::Connected], CallState::Transferring)
    }

    /// `Connected/Hold/Transferring/Ringing/Calling --end--> Ended`.
    /// Removes the call from the active map and files it in history.
    pub fn end(&self, id: &str) -> Option<Call> {
        let (_, mut call) = self.calls.remove(id)?;
        call.state = CallState::Ended;
        call.end_time = Some(Utc::now());
        let _ = call.state_tx.send(CallState::Ended);
        self.dtmf_receivers.remove(id);

        info!(call_id = id, duration_ms = call.duration().num_milliseconds(), "call ended");
        let mut history = self.history.lock();
        history.push_back(call.clone());
        if history.len() > self.history_limit {
            history.pop_front();
        }
        Some(call)
    }

    /// All calls with state != Ended (§8: the "active_calls" invariant).
    pub fn active(&self) -> Vec<Call> {
        self.calls.iter().map(|c| c.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.calls.len()
    }

    pub fn for_extension(&self, extension: &str) -> Vec<Call> {
        self.calls.iter().filter(|c| c.from == extension || c.to == extension).map(|c| c.clone()).collect()
    }

    pub fn history(&self) -> Vec<Call> {
        self.history.lock().iter().cloned().collect()
    }
}

impl Default for CallManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle_reaches_connected_then_ended() {
        let manager = CallManager::new();
        manager.create("call-1", "1001", "1002");
        manager.ring("call-1").unwrap();
        let connected = manager.connect("call-1").unwrap();
        assert_eq!(connected.state, CallState::Connected);
        assert!(connected.answer_time.is_some());

        let ended = manager.end("call-1").unwrap();
        assert_eq!(ended.state, CallState::Ended);
        assert!(manager.get("call-1").is_none());
        assert_eq!(manager.history().len(), 1);
    }

    #[test]
    fn active_calls_contains_id_iff_not_ended() {
        let manager = CallManager::new();
        manager.create("call-1", "1001", "1002");
        assert!(manager.active().iter().any(|c| c.id == "call-1"));
        manager.end("call-1");
        assert!(!manager.active().iter().any(|c| c.id == "call-1"));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let manager = CallManager::new();
        manager.create("call-1", "1001", "1002");
        // Can't hold a call that was never connected.
        assert!(manager.hold("call-1").is_err());
    }

    #[test]
    fn hold_and_resume_round_trip() {
        let manager = CallManager::new();
        manager.create("call-1", "1001", "1002");
        manager.ring("call-1").unwrap();
        manager.connect("call-1").unwrap();
        assert_eq!(manager.hold("call-1").unwrap().state, CallState::Hold);
        assert_eq!(manager.resume("call-1").unwrap().state, CallState::Connected);
    }

    #[test]
    fn dtmf_queue_delivers_in_order() {
        let manager = CallManager::new();
        manager.create("call-1", "1001", "1002");
        let mut rx = manager.take_dtmf_receiver("call-1").unwrap();
        manager.push_dtmf("call-1", '1');
        manager.push_dtmf("call-1", '2');
        assert_eq!(rx.try_recv().unwrap(), '1');
        assert_eq!(rx.try_recv().unwrap(), '2');
    }

    #[test]
    fn dtmf_for_unknown_call_is_ignored_not_panicking() {
        let manager = CallManager::new();
        manager.push_dtmf("nonexistent", '5');
    }

    #[test]
    fn for_extension_matches_either_leg() {
        let manager = CallManager::new();
        manager.create("call-1", "1001", "1002");
        assert_eq!(manager.for_extension("1002").len(), 1);
        assert_eq!(manager.for_extension("9999").len(), 0);
    }
}
