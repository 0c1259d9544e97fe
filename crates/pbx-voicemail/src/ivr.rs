//! The voicemail IVR state machine (§4.11) and its driving loop.
//!
//! The state machine itself ([`IvrSession::apply`]) is a pure
//! function: state in, event in, actions out. Everything with I/O
//! (prompt playback, recording, persistence) lives in [`IvrDriver`],
//! which is the only part that needs a `select!` loop.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::VoicemailResult;
use crate::sink::{MailboxMessage, VoicemailSink};

pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_RECORD_TIME: Duration = Duration::from_secs(120);
pub const PIN_LENGTH: usize = 4;
pub const MAX_PIN_FAILURES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvrState {
    Welcome,
    PinEntry,
    MainMenu,
    Listening,
    Options,
    RecordingGreeting,
    ReviewingGreeting,
    Goodbye,
}

/// Inputs the driver feeds into the state machine (§4.11: "digit
/// 0-9,*,# are the only inputs; additional events are `prompt_done`,
/// `silence_timeout`, `max_record_time`"). `MessagesLoaded` is the
/// driver's answer to a `FetchMessages` action: it can't be produced
/// synchronously since fetching the mailbox is I/O.
#[derive(Debug, Clone)]
pub enum IvrEvent {
    Digit(char),
    PromptDone,
    SilenceTimeout,
    MaxRecordTime,
    MessagesLoaded(Vec<MailboxMessage>),
}

/// The closed tagged variant replacing a dynamically-typed action
/// dictionary (Design Notes §9).
#[derive(Debug, Clone, PartialEq)]
pub enum IvrAction {
    PlayPrompt { name: &'static str },
    PlayMessage { path: String, id: String, caller: String },
    PlayGreeting { bytes: Vec<u8> },
    StartRecording,
    StopRecording,
    CollectDigit,
    Hangup,
    /// Fetch the mailbox's unread messages; the driver feeds the
    /// result back in as `IvrEvent::MessagesLoaded`.
    FetchMessages,
    MarkListened { id: String },
    MarkUnread { id: String },
    DeleteMessage { id: String },
}

/// Per-call IVR session state (§3 "IVR Session").
pub struct IvrSession {
    pub state: IvrState,
    pin_buffer: String,
    stored_pin: String,
    pin_failures: u8,
    /// The playback list fetched on entering `Listening`, and the
    /// cursor's position within it (§3 "message cursor").
    messages: Vec<MailboxMessage>,
    message_cursor: usize,
    /// The message currently presented to the caller, i.e. the one
    /// `prompt_done`/`7` (Listening) or `1`/`2` (Options) act on.
    current_message: Option<MailboxMessage>,
    recorded_greeting: Option<Vec<u8>>,
}

impl IvrSession {
    pub fn new(stored_pin: impl Into<String>) -> Self {
        IvrSession {
            state: IvrState::Welcome,
            pin_buffer: String::new(),
            stored_pin: stored_pin.into(),
            pin_failures: 0,
            messages: Vec::new(),
            message_cursor: 0,
            current_message: None,
            recorded_greeting: None,
        }
    }

    /// Apply one event to the state machine, returning the actions the
    /// driver must take. A pure function: same `(state, event)` always
    /// produces the same `(new_state, actions)`.
    pub fn apply(&mut self, event: IvrEvent) -> Vec<IvrAction> {
        use IvrEvent::*;
        use IvrState::*;

        // A 60s silence anywhere drops straight to Goodbye (§4.11).
        if matches!(&event, SilenceTimeout) && self.state != Goodbye {
            self.state = Goodbye;
            return vec![IvrAction::PlayPrompt { name: "goodbye" }, IvrAction::Hangup];
        }

        match (self.state, event) {
            (Welcome, _) => {
                self.state = PinEntry;
                vec![IvrAction::PlayPrompt { name: "enter_pin" }, IvrAction::CollectDigit]
            }

            (PinEntry, Digit(d)) if d.is_ascii_digit() => {
                self.pin_buffer.push(d);
                if self.pin_buffer.len() < PIN_LENGTH {
                    return vec![IvrAction::CollectDigit];
                }
                if self.pin_buffer == self.stored_pin {
                    self.pin_buffer.clear();
                    self.pin_failures = 0;
                    self.state = MainMenu;
                    vec![IvrAction::PlayPrompt { name: "main_menu" }, IvrAction::CollectDigit]
                } else {
                    self.pin_buffer.clear();
                    self.pin_failures += 1;
                    if self.pin_failures >= MAX_PIN_FAILURES {
                        self.state = Goodbye;
                        vec![IvrAction::PlayPrompt { name: "goodbye" }, IvrAction::Hangup]
                    } else {
                        vec![IvrAction::PlayPrompt { name: "invalid_pin" }, IvrAction::CollectDigit]
                    }
                }
            }
            (PinEntry, _) => vec![IvrAction::CollectDigit],

            (MainMenu, Digit('1')) => {
                self.state = Listening;
                vec![IvrAction::FetchMessages]
            }
            (MainMenu, Digit('2')) => {
                self.state = Options;
                vec![IvrAction::PlayPrompt { name: "options" }, IvrAction::CollectDigit]
            }
            (MainMenu, Digit('3')) => {
                self.state = RecordingGreeting;
                vec![IvrAction::PlayPrompt { name: "beep" }, IvrAction::StartRecording]
            }
            (MainMenu, Digit('*')) => {
                self.state = Goodbye;
                vec![IvrAction::PlayPrompt { name: "goodbye" }, IvrAction::Hangup]
            }
            (MainMenu, _) => vec![IvrAction::CollectDigit],

            (Listening, MessagesLoaded(list)) => {
                self.messages = list;
                self.message_cursor = 0;
                self.present_current_message()
            }
            (Listening, PromptDone) => {
                // Mark listened but keep `current_message` around: the
                // caller can still reach it from Options (mark-unread,
                // delete) before the next `1` reloads the mailbox.
                let mark = self.current_message.as_ref().map(|m| IvrAction::MarkListened { id: m.id.clone() });
                self.message_cursor += 1;
                self.state = MainMenu;
                let mut actions: Vec<IvrAction> = mark.into_iter().collect();
                actions.push(IvrAction::PlayPrompt { name: "main_menu" });
                actions.push(IvrAction::CollectDigit);
                actions
            }
            (Listening, Digit('7')) => {
                let delete = self.current_message.take().map(|m| IvrAction::DeleteMessage { id: m.id });
                self.state = MainMenu;
                let mut actions: Vec<IvrAction> = delete.into_iter().collect();
                actions.push(IvrAction::PlayPrompt { name: "main_menu" });
                actions.push(IvrAction::CollectDigit);
                actions
            }
            (Listening, _) => vec![IvrAction::CollectDigit],

            (Options, Digit('1')) => {
                let action = self.current_message.take().map(|m| IvrAction::MarkUnread { id: m.id });
                self.state = MainMenu;
                let mut actions: Vec<IvrAction> = action.into_iter().collect();
                actions.push(IvrAction::PlayPrompt { name: "main_menu" });
                actions.push(IvrAction::CollectDigit);
                actions
            }
            (Options, Digit('2')) => {
                let action = self.current_message.take().map(|m| IvrAction::DeleteMessage { id: m.id });
                self.state = MainMenu;
                let mut actions: Vec<IvrAction> = action.into_iter().collect();
                actions.push(IvrAction::PlayPrompt { name: "main_menu" });
                actions.push(IvrAction::CollectDigit);
                actions
            }
            (Options, _) => {
                // `3` (next) and anything else just return to MainMenu;
                // a following `1` reloads the mailbox fresh.
                self.state = MainMenu;
                vec![IvrAction::PlayPrompt { name: "main_menu" }, IvrAction::CollectDigit]
            }

            (RecordingGreeting, Digit('#')) | (RecordingGreeting, MaxRecordTime) => {
                self.state = ReviewingGreeting;
                vec![IvrAction::StopRecording, IvrAction::PlayPrompt { name: "greeting_review_menu" }, IvrAction::CollectDigit]
            }
            (RecordingGreeting, _) => vec![IvrAction::CollectDigit],

            (ReviewingGreeting, Digit('1')) => {
                let bytes = self.recorded_greeting.clone().unwrap_or_default();
                vec![IvrAction::PlayGreeting { bytes }, IvrAction::PlayPrompt { name: "greeting_review_menu" }, IvrAction::CollectDigit]
            }
            (ReviewingGreeting, Digit('2')) => {
                self.state = MainMenu;
                vec![IvrAction::PlayPrompt { name: "main_menu" }, IvrAction::CollectDigit]
            }
            (ReviewingGreeting, Digit('3')) => {
                self.state = RecordingGreeting;
                vec![IvrAction::PlayPrompt { name: "beep" }, IvrAction::StartRecording]
            }
            (ReviewingGreeting, _) => vec![IvrAction::CollectDigit],

            (Goodbye, _) => vec![IvrAction::Hangup],
        }
    }

    /// Present the message at the cursor, or fall back to `MainMenu`
    /// with a `no_messages` prompt once the playback list is exhausted.
    fn present_current_message(&mut self) -> Vec<IvrAction> {
        match self.messages.get(self.message_cursor).cloned() {
            Some(message) => {
                let action = IvrAction::PlayMessage {
                    path: message.wav_path.clone(),
                    id: message.id.clone(),
                    caller: message.caller_id.clone(),
                };
                self.current_message = Some(message);
                vec![action]
            }
            None => {
                self.current_message = None;
                self.state = IvrState::MainMenu;
                vec![IvrAction::PlayPrompt { name: "no_messages" }, IvrAction::CollectDigit]
            }
        }
    }

    /// Stash the just-recorded greeting buffer for `apply`'s `1`
    /// ("play saved greeting") to use without re-reading the sink.
    pub fn set_recorded_greeting(&mut self, bytes: Vec<u8>) {
        self.recorded_greeting = Some(bytes);
    }

    pub fn message_cursor(&self) -> usize {
        self.message_cursor
    }
}

/// DTMF source priority (§4.11): SIP-INFO is consumed before in-band
/// detection is attempted.
pub enum DigitSource {
    SipInfo(char),
    InBand(char),
}

impl DigitSource {
    pub fn digit(&self) -> char {
        match self {
            DigitSource::SipInfo(d) | DigitSource::InBand(d) => *d,
        }
    }
}

/// Pick the winning digit when both sources produce one in the same
/// window (§5 ordering guarantee: SIP-INFO wins).
pub fn resolve_digit_priority(info_digit: Option<char>, inband_digit: Option<char>) -> Option<DigitSource> {
    match (info_digit, inband_digit) {
        (Some(d), _) => Some(DigitSource::SipInfo(d)),
        (None, Some(d)) => Some(DigitSource::InBand(d)),
        (None, None) => None,
    }
}

/// Persist a completed recording and log/ignore sink failures per
/// §4's "Voicemail sink write error" boundary behavior: the IVR stays
/// connected and returns to MainMenu rather than ending the call.
pub async fn persist_recording(
    sink: &dyn VoicemailSink,
    extension: &str,
    caller_id: &str,
    wav_bytes: Vec<u8>,
    duration_seconds: u32,
) -> Option<String> {
    match sink.save_message(extension, caller_id, wav_bytes, duration_seconds).await {
        Ok(id) => {
            info!(extension, %id, duration_seconds, "voicemail message saved");
            Some(id)
        }
        Err(e) => {
            warn!(extension, error = %e, "voicemail sink write failed, returning to main menu");
            None
        }
    }
}

pub type IvrResult<T> = VoicemailResult<T>;
