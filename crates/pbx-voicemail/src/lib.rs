//! Voicemail IVR: the per-call mailbox state machine and the driver
//! that runs it against real audio I/O.

pub mod driver;
pub mod error;
pub mod ivr;
pub mod sink;

pub mod prelude {
    pub use crate::driver::IvrDriver;
    pub use crate::error::{VoicemailError, VoicemailResult};
    pub use crate::ivr::{DigitSource, IvrAction, IvrEvent, IvrSession, IvrState};
    pub use crate::sink::{FilesystemSink, InMemorySink, MailboxMessage, VoicemailSink};
}
