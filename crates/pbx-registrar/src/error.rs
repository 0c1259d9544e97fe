//! Error types for the registrar.

use thiserror::Error;

pub type RegistrarResult<T> = Result<T, RegistrarError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("unknown extension {0:?}")]
    UnknownExtension(String),

    #[error("extension {0:?} already exists")]
    DuplicateExtension(String),

    #[error("missing or malformed Contact header")]
    MissingContact,

    #[error("missing or malformed Expires value")]
    MissingExpires,

    #[error("authentication failed")]
    AuthFailed,
}

impl RegistrarError {
    pub fn category(&self) -> &'static str {
        match self {
            RegistrarError::UnknownExtension(_) | RegistrarError::DuplicateExtension(_) => "provisioning",
            RegistrarError::MissingContact | RegistrarError::MissingExpires => "sip-message",
            RegistrarError::AuthFailed => "auth",
        }
    }
}
