//! Call Manager, dialplan Router, and the `SipRequestHandler` wiring
//! that connects both to the transport/dialog layer (§4.8, §4.10, §4.7).

pub mod call;
pub mod cdr;
pub mod error;
pub mod external;
pub mod handler_impl;
pub mod router;

pub mod prelude {
    pub use crate::call::{Call, CallManager, CallState};
    pub use crate::cdr::{CdrSink, Disposition, NullCdrSink, TracingCdrSink};
    pub use crate::error::{CallError, CallResult};
    pub use crate::external::{DirectoryEntry, ExtensionRegistry};
    pub use crate::handler_impl::PbxHandler;
    pub use crate::router::{Destination, Router};
}
