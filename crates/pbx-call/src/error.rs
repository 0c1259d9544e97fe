//! Error types for call management and routing (§4.8, §4.10, §7).

use pbx_sip::status::StatusCode;
use thiserror::Error;

pub type CallResult<T> = Result<T, CallError>;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("call {0:?} not found")]
    NotFound(String),

    #[error("invalid transition from {from:?} on call {call_id:?}")]
    InvalidTransition { call_id: String, from: &'static str },

    #[error("no dialplan pattern matches destination {0:?}")]
    NoRoute(String),

    #[error("extension {0:?} is not registered")]
    NotRegistered(String),

    #[error("RTP relay failure: {0}")]
    Rtp(#[from] pbx_rtp::error::RtpError),

    #[error("voicemail failure: {0}")]
    Voicemail(#[from] pbx_voicemail::error::VoicemailError),

    #[error("malformed SIP message: {0}")]
    Malformed(#[from] pbx_sip::error::SipError),
}

impl CallError {
    pub fn category(&self) -> &'static str {
        match self {
            CallError::NotFound(_) | CallError::InvalidTransition { .. } => "call-state",
            CallError::NoRoute(_) | CallError::NotRegistered(_) => "routing",
            CallError::Rtp(_) => "rtp",
            CallError::Voicemail(_) => "voicemail",
            CallError::Malformed(_) => "sip-message",
        }
    }

    /// Map to the SIP response this layer sends back (§7).
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            CallError::NotFound(_) => StatusCode::NOT_FOUND,
            CallError::InvalidTransition { .. } => StatusCode::new(500),
            CallError::NoRoute(_) | CallError::NotRegistered(_) => StatusCode::NOT_FOUND,
            CallError::Rtp(pbx_rtp::error::RtpError::PortsExhausted) => StatusCode::SERVICE_UNAVAILABLE,
            CallError::Rtp(_) => StatusCode::SERVER_ERROR,
            CallError::Voicemail(_) => StatusCode::SERVER_ERROR,
            CallError::Malformed(_) => StatusCode::BAD_REQUEST,
        }
    }
}
