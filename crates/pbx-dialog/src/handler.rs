//! The boundary trait between this transport/dialog layer and the
//! call-semantics layer above it (§4.7's method table). Kept narrow
//! and `#[async_trait]` so `pbx-dialog` depends on nothing but
//! `pbx-sip`, matching the teacher's pattern of defining collaborator
//! traits at crate boundaries instead of a direct crate dependency
//! upward.

use std::net::SocketAddr;

use async_trait::async_trait;
use pbx_sip::message::SipMessage;

/// Outcome of handing a request up to the call-semantics layer: the
/// response to send, plus whether this dialog should be torn down
/// after sending it.
pub struct HandledRequest {
    pub response: SipMessage,
    pub terminate_dialog: bool,
}

impl HandledRequest {
    pub fn reply(response: SipMessage) -> Self {
        HandledRequest { response, terminate_dialog: false }
    }

    pub fn reply_and_terminate(response: SipMessage) -> Self {
        HandledRequest { response, terminate_dialog: true }
    }
}

/// Implemented by whatever owns Call/Extension state (in practice the
/// `pbxd` binary's wiring layer, composing `pbx-call` and
/// `pbx-registrar`) to answer each SIP method this PBX understands.
#[async_trait]
pub trait SipRequestHandler: Send + Sync {
    async fn handle_register(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest;

    /// A new INVITE with no matching dialog.
    async fn handle_invite(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest;

    /// An INVITE matching an existing confirmed dialog: SDP
    /// renegotiation (hold/resume).
    async fn handle_reinvite(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest;

    async fn handle_ack(&self, request: &SipMessage, source: SocketAddr);

    async fn handle_bye(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest;

    async fn handle_cancel(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest;

    /// SIP INFO carrying `Signal=<digit>` (application/dtmf-relay or
    /// application/dtmf).
    async fn handle_info(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest;

    async fn handle_options(&self, request: &SipMessage, source: SocketAddr) -> HandledRequest;
}
