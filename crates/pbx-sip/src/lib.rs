//! SIP and SDP message codec for the PBX core (§4.1, §4.2).
//!
//! This crate is deliberately stateless: it parses bytes into
//! [`message::SipMessage`]/[`sdp::SdpSession`] and serializes them back.
//! Transaction/dialog state lives in `pbx-dialog`.

pub mod error;
pub mod header;
pub mod message;
pub mod method;
pub mod sdp;
pub mod status;
pub mod uri;

pub mod prelude {
    pub use crate::error::{SipError, SipResult};
    pub use crate::header::{Header, HeaderList};
    pub use crate::message::{SipMessage, StartLine};
    pub use crate::method::Method;
    pub use crate::sdp::{build_answer, AnswerParams, RtpMap, SdpSession};
    pub use crate::status::StatusCode;
    pub use crate::uri::SipUri;
}
