//! Error types for the voicemail IVR.

use thiserror::Error;

pub type VoicemailResult<T> = Result<T, VoicemailError>;

#[derive(Error, Debug)]
pub enum VoicemailError {
    #[error("incorrect PIN")]
    IncorrectPin,

    #[error("no unread messages")]
    NoMessages,

    #[error("audio engine failure: {0}")]
    Media(#[from] pbx_media::error::MediaError),

    #[error("RTP failure: {0}")]
    Rtp(#[from] pbx_rtp::error::RtpError),

    #[error("voicemail sink failure: {0}")]
    Sink(String),
}

impl VoicemailError {
    pub fn category(&self) -> &'static str {
        match self {
            VoicemailError::IncorrectPin => "auth",
            VoicemailError::NoMessages => "mailbox",
            VoicemailError::Media(_) => "media",
            VoicemailError::Rtp(_) => "rtp",
            VoicemailError::Sink(_) => "sink",
        }
    }
}
