//! UDP transport: the single socket that reads SIP datagrams, matches
//! them to transactions/dialogs, and dispatches to a
//! [`SipRequestHandler`] (§4.7).

use std::net::SocketAddr;
use std::sync::Arc;

use pbx_sip::message::{SipMessage, StartLine};
use pbx_sip::method::Method;
use pbx_sip::status::StatusCode;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::dialog::{DialogKey, DialogTable};
use crate::error::{DialogError, DialogResult};
use crate::handler::{HandledRequest, SipRequestHandler};
use crate::transaction::{TransactionKey, TransactionKind, TransactionTable};

pub struct SipTransport {
    socket: Arc<UdpSocket>,
    transactions: Arc<TransactionTable>,
    dialogs: Arc<DialogTable>,
}

impl SipTransport {
    pub async fn bind(addr: SocketAddr, transactions: Arc<TransactionTable>, dialogs: Arc<DialogTable>) -> DialogResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| DialogError::Io(e.to_string()))?;
        Ok(SipTransport { socket: Arc::new(socket), transactions, dialogs })
    }

    pub fn local_addr(&self) -> DialogResult<SocketAddr> {
        self.socket.local_addr().map_err(|e| DialogError::Io(e.to_string()))
    }

    /// The underlying socket, shared with whatever originates outbound
    /// requests of its own (the dialplan router's second call leg).
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Drive the read loop forever, dispatching each datagram to
    /// `handler` on its own task so a slow handler never blocks the
    /// socket.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn SipRequestHandler>) -> DialogResult<()> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, src) = self.socket.recv_from(&mut buf).await.map_err(|e| DialogError::Io(e.to_string()))?;
            let datagram = buf[..n].to_vec();
            let this = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                this.handle_datagram(&datagram, src, handler).await;
            });
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddr, handler: Arc<dyn SipRequestHandler>) {
        let message = match SipMessage::parse(datagram) {
            Ok(m) => m,
            Err(e) => {
                warn!(%src, error = %e, "dropping malformed SIP datagram");
                return;
            }
        };
        if !message.is_request() {
            let key = crate::transaction::via_branch(&message)
                .zip(crate::transaction::cseq_method(&message))
                .map(|(branch, method)| TransactionKey::new(branch, method));
            let delivered = key.as_ref().map(|k| self.transactions.deliver_to_client(k, message.clone())).unwrap_or(false);
            if !delivered {
                debug!(%src, "ignoring SIP response with no matching client transaction");
            }
            return;
        }

        let method = message.method().cloned().unwrap_or(Method::Other(String::new()));
        let outcome = match method {
            Method::Register => handler.handle_register(&message, src).await,
            Method::Invite => {
                if self.matches_confirmed_dialog(&message) {
                    handler.handle_reinvite(&message, src).await
                } else {
                    handler.handle_invite(&message, src).await
                }
            }
            Method::Ack => {
                if let Some(key) = dialog_key_of(&message) {
                    self.dialogs.confirm(&key);
                    self.transactions.stop(&TransactionKey::new(branch_of(&message), "INVITE"));
                }
                handler.handle_ack(&message, src).await;
                return;
            }
            Method::Bye => handler.handle_bye(&message, src).await,
            Method::Cancel => handler.handle_cancel(&message, src).await,
            Method::Info => handler.handle_info(&message, src).await,
            Method::Options => handler.handle_options(&message, src).await,
            Method::Other(token) => {
                debug!(%src, method = %token, "no handler for method, replying 501");
                HandledRequest::reply(SipMessage::response_default(StatusCode::new(501)))
            }
        };

        if let Some(key) = dialog_key_of(&message) {
            if outcome.terminate_dialog {
                self.dialogs.remove(&key);
            }
        }

        self.send_response(&message, &outcome.response, src).await;
    }

    fn matches_confirmed_dialog(&self, request: &SipMessage) -> bool {
        dialog_key_of(request).map(|key| self.dialogs.get(&key).is_some()).unwrap_or(false)
    }

    async fn send_response(&self, request: &SipMessage, response: &SipMessage, dest: SocketAddr) {
        let bytes = response.serialize();
        if let Err(e) = self.socket.send_to(&bytes, dest).await {
            warn!(%dest, error = %e, "failed to send SIP response");
            return;
        }

        if let StartLine::Request { method: Method::Invite, .. } = &request.start_line {
            let key = TransactionKey::new(branch_of(request), "INVITE");
            let socket = self.socket.clone();
            let response = response.clone();
            self.transactions.start_server_transaction(key, TransactionKind::InviteServer, response, move |msg| {
                let socket = socket.clone();
                async move {
                    let _ = socket.send_to(&msg.serialize(), dest).await;
                }
            });
        }
    }
}

fn branch_of(message: &SipMessage) -> String {
    message
        .header("via")
        .and_then(|via| via.split(';').find_map(|p| p.trim().strip_prefix("branch=")))
        .unwrap_or("unknown")
        .to_string()
}

fn dialog_key_of(message: &SipMessage) -> Option<DialogKey> {
    let call_id = message.header("call-id")?.to_string();
    let from_tag = tag_of(message.header("from")?)?;
    let to_tag = message.header("to").and_then(tag_of);
    // Requests inside an established dialog always carry both tags;
    // a fresh INVITE's To has none yet, so this simply won't match.
    to_tag.map(|to_tag| DialogKey::new(call_id, from_tag, to_tag))
}

fn tag_of(header_value: &str) -> Option<String> {
    header_value.split(';').find_map(|p| p.trim().strip_prefix("tag=")).map(|s| s.to_string())
}
