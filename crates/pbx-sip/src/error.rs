//! Error types for the SIP/SDP codec.

use thiserror::Error;

/// Result alias for SIP codec operations.
pub type SipResult<T> = Result<T, SipError>;

/// Failures that can occur while parsing or building a SIP message.
///
/// Every variant here is a *local* parse failure: the transport layer
/// turns any of these into a `400 Bad Request` and keeps running (§4.1,
/// §7 `MalformedMessage`). None of these propagate past the codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("missing blank line separating headers from body")]
    MissingHeaderTerminator,

    #[error("start line is neither a known request method nor a status line: {0:?}")]
    BadStartLine(String),

    #[error("header line has no colon separator: {0:?}")]
    BadHeaderLine(String),

    #[error("Content-Length ({declared}) does not match available body bytes ({actual})")]
    ContentLengthMismatch { declared: usize, actual: usize },

    #[error("Content-Length header value is not a valid integer: {0:?}")]
    BadContentLength(String),

    #[error("malformed SDP: {0}")]
    MalformedSdp(String),

    #[error("malformed URI: {0:?}")]
    BadUri(String),
}

impl SipError {
    /// Coarse category, useful for metrics/logging grouping.
    pub fn category(&self) -> &'static str {
        match self {
            SipError::MalformedSdp(_) => "sdp",
            _ => "sip-message",
        }
    }
}
