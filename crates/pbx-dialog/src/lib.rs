//! SIP transport, transaction, and dialog layer (§4.7).

pub mod auth;
pub mod client;
pub mod dialog;
pub mod error;
pub mod handler;
pub mod transaction;
pub mod transport;

pub mod prelude {
    pub use crate::auth::{compute_ha1, compute_response, verify_response, DigestCredentials, FailureTracker};
    pub use crate::client::{invite, InviteOutcome};
    pub use crate::dialog::{Dialog, DialogKey, DialogState, DialogTable};
    pub use crate::error::{DialogError, DialogResult};
    pub use crate::handler::{HandledRequest, SipRequestHandler};
    pub use crate::transaction::{TransactionKey, TransactionKind, TransactionTable};
    pub use crate::transport::SipTransport;
}
