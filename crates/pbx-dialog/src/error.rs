//! Error types for the SIP transport/transaction/dialog layer.

use pbx_sip::status::StatusCode;
use thiserror::Error;

pub type DialogResult<T> = Result<T, DialogError>;

/// Failures at the transport/transaction/dialog boundary (§4.7, §7).
///
/// Every variant has a defined SIP response mapping via
/// [`DialogError::to_status_code`] — nothing escapes this layer as a
/// bare error body, matching the "user-visible failure surface is a
/// SIP response code" design.
#[derive(Error, Debug)]
pub enum DialogError {
    #[error("malformed SIP message: {0}")]
    Malformed(#[from] pbx_sip::error::SipError),

    #[error("no dialog matches call-id={call_id:?} tags=({local_tag:?}, {remote_tag:?})")]
    NoMatchingDialog { call_id: String, local_tag: Option<String>, remote_tag: Option<String> },

    #[error("no transaction matches branch={branch:?} method={method:?}")]
    NoMatchingTransaction { branch: String, method: String },

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed for {0:?}")]
    AuthFailed(String),

    #[error("source blocked after repeated authentication failures")]
    SourceBlocked,

    #[error("call {0:?} not found")]
    CallNotFound(String),

    #[error("request for unrecognized destination {0:?}")]
    NoRoute(String),

    #[error("transport I/O failure: {0}")]
    Io(String),

    #[error("transaction timed out")]
    TransactionTimeout,
}

impl DialogError {
    /// Coarse category, useful for metrics/logging grouping.
    pub fn category(&self) -> &'static str {
        match self {
            DialogError::Malformed(_) => "sip-message",
            DialogError::NoMatchingDialog { .. } | DialogError::NoMatchingTransaction { .. } => "transaction",
            DialogError::AuthRequired | DialogError::AuthFailed(_) | DialogError::SourceBlocked => "auth",
            DialogError::CallNotFound(_) | DialogError::NoRoute(_) => "routing",
            DialogError::Io(_) => "io",
            DialogError::TransactionTimeout => "timeout",
        }
    }

    /// Map to the SIP response this layer sends back for the
    /// request that triggered the error (§7).
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            DialogError::Malformed(_) => StatusCode::BAD_REQUEST,
            DialogError::NoMatchingDialog { .. } | DialogError::NoMatchingTransaction { .. } => {
                StatusCode::BAD_REQUEST
            }
            DialogError::AuthRequired => StatusCode::UNAUTHORIZED,
            DialogError::AuthFailed(_) => StatusCode::FORBIDDEN,
            DialogError::SourceBlocked => StatusCode::FORBIDDEN,
            DialogError::CallNotFound(_) => StatusCode::NOT_FOUND,
            DialogError::NoRoute(_) => StatusCode::NOT_FOUND,
            DialogError::Io(_) | DialogError::TransactionTimeout => StatusCode::SERVER_ERROR,
        }
    }
}
