//! Error types for RTP packetizing and relaying.

use thiserror::Error;

pub type RtpResult<T> = Result<T, RtpError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("packet shorter than the 12-byte fixed RTP header ({0} bytes)")]
    PacketTooShort(usize),

    #[error("unsupported RTP version {0} (only version 2 is handled)")]
    UnsupportedVersion(u8),

    #[error("no RTP/RTCP ports available in the configured range")]
    PortsExhausted,

    #[error("no relay entry for call {0:?}")]
    UnknownCall(String),

    #[error("socket I/O error: {0}")]
    Io(String),
}

impl RtpError {
    pub fn category(&self) -> &'static str {
        match self {
            RtpError::PortsExhausted => "resource-exhausted",
            RtpError::Io(_) => "io",
            _ => "packet",
        }
    }
}
