//! Transaction table: matches responses/retransmissions to the
//! request that started them, and drives RFC 3261 retransmission
//! timers (§4.7).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pbx_sip::message::SipMessage;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, warn};

/// RFC 3261 Timer T1 (RTT estimate) and T2 (maximum retransmit
/// interval for non-INVITE and INVITE response retransmission).
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
/// Timer F: non-INVITE transaction final-response timeout, 64*T1.
pub const TIMER_F: Duration = Duration::from_millis(64 * 500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    InviteClient,
    InviteServer,
    NonInviteClient,
    NonInviteServer,
}

/// Transaction table key: branch-id plus method, per §4.7.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: String,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: impl Into<String>) -> Self {
        TransactionKey { branch: branch.into(), method: method.into() }
    }
}

/// State shared between a transaction's owner and its retransmission
/// task.
struct TransactionState {
    kind: TransactionKind,
    last_response: Mutex<Option<SipMessage>>,
    done: mpsc::Sender<()>,
}

/// Tracks in-flight transactions and retransmits non-2xx INVITE
/// final responses until an ACK or Timer F/H expiry, and non-INVITE
/// final responses until Timer F.
pub struct TransactionTable {
    transactions: DashMap<TransactionKey, Arc<TransactionState>>,
    client_waiters: DashMap<TransactionKey, mpsc::Sender<SipMessage>>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    pub fn new() -> Self {
        TransactionTable { transactions: DashMap::new(), client_waiters: DashMap::new() }
    }

    /// Register interest in responses to a request this process just
    /// originated (the outbound INVITE leg, §4.10). `key` is the
    /// request's own Via branch plus its method; every provisional and
    /// the eventual final response delivered to it arrive on the
    /// returned channel, in order.
    pub fn register_client(&self, key: TransactionKey) -> mpsc::Receiver<SipMessage> {
        let (tx, rx) = mpsc::channel(8);
        self.client_waiters.insert(key, tx);
        rx
    }

    /// Route an inbound response to its waiting client transaction, if
    /// one is registered. Returns whether a waiter was found.
    pub fn deliver_to_client(&self, key: &TransactionKey, response: SipMessage) -> bool {
        match self.client_waiters.get(key) {
            Some(tx) => {
                let _ = tx.try_send(response);
                true
            }
            None => false,
        }
    }

    /// Stop routing responses to `key` (transaction resolved or timed out).
    pub fn forget_client(&self, key: &TransactionKey) {
        self.client_waiters.remove(key);
    }

    /// Start a server transaction that retransmits `response` at
    /// T1, 2*T1, 4*T1, ... up to T2, via `send`, until `stop` is
    /// called (ACK received, or a non-INVITE transaction's final
    /// response has been sent once and Timer F elapses).
    pub fn start_server_transaction<F, Fut>(&self, key: TransactionKey, kind: TransactionKind, response: SipMessage, send: F)
    where
        F: Fn(SipMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let state = Arc::new(TransactionState {
            kind,
            last_response: Mutex::new(Some(response.clone())),
            done: done_tx,
        });
        self.transactions.insert(key.clone(), state.clone());

        let retransmit_invite_final = matches!(kind, TransactionKind::InviteServer) && !is_2xx(&response);
        if !retransmit_invite_final {
            return;
        }

        tokio::spawn(async move {
            let mut delay = T1;
            loop {
                tokio::select! {
                    _ = done_rx.recv() => return,
                    _ = tokio::time::sleep(delay) => {
                        send(response.clone()).await;
                        delay = (delay * 2).min(T2);
                        if delay >= TIMER_F {
                            warn!("INVITE server transaction exhausted retransmissions, giving up");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Signal a server transaction's retransmission task to stop
    /// (e.g. on ACK for the final response).
    pub fn stop(&self, key: &TransactionKey) {
        if let Some((_, state)) = self.transactions.remove(key) {
            let _ = state.done.try_send(());
        }
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.transactions.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    /// Periodic sweep is a no-op here: transactions self-terminate via
    /// their retransmission task's own Timer F/stop signal. Exposed
    /// for symmetry with `RtpRelay::sweep_idle` and future expiry-only
    /// (no retransmit) non-INVITE transactions.
    pub fn sweep(&self) {
        debug!(active = self.active_count(), "transaction table sweep");
    }
}

fn is_2xx(message: &SipMessage) -> bool {
    matches!(&message.start_line, pbx_sip::message::StartLine::Response { code, .. } if (200..300).contains(code))
}

/// The branch parameter off a message's first Via header.
pub fn via_branch(message: &SipMessage) -> Option<String> {
    message.header("via")?.split(';').find_map(|p| p.trim().strip_prefix("branch=")).map(|s| s.to_string())
}

/// The method token out of a CSeq header (`"1 INVITE"` -> `"INVITE"`),
/// since a response's start-line carries no method of its own.
pub fn cseq_method(message: &SipMessage) -> Option<String> {
    message.header("cseq")?.split_whitespace().nth(1).map(|s| s.to_string())
}

/// Spawn a periodic sweep task; matches the RTP relay's idle-sweep
/// idiom so both background janitors look the same in the logs.
pub fn spawn_sweeper(table: Arc<TransactionTable>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            table.sweep();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_key_equality_is_branch_and_method() {
        let a = TransactionKey::new("z9hG4bK1", "INVITE");
        let b = TransactionKey::new("z9hG4bK1", "INVITE");
        let c = TransactionKey::new("z9hG4bK1", "BYE");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn client_waiter_receives_delivered_responses_in_order() {
        let table = TransactionTable::new();
        let key = TransactionKey::new("z9hG4bK3", "INVITE");
        let mut rx = table.register_client(key.clone());

        let trying = SipMessage::response_default(pbx_sip::status::StatusCode::TRYING);
        let ok = SipMessage::response_default(pbx_sip::status::StatusCode::OK);
        assert!(table.deliver_to_client(&key, trying.clone()));
        assert!(table.deliver_to_client(&key, ok.clone()));

        assert_eq!(rx.recv().await, Some(trying));
        assert_eq!(rx.recv().await, Some(ok));

        table.forget_client(&key);
        assert!(!table.deliver_to_client(&key, SipMessage::response_default(pbx_sip::status::StatusCode::RINGING)));
    }

    #[test]
    fn via_branch_and_cseq_method_extract_their_fields() {
        let msg = SipMessage::request(pbx_sip::method::Method::Invite, "sip:bob@pbx")
            .with_header("Via", "SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK9")
            .with_header("CSeq", "1 INVITE");
        assert_eq!(via_branch(&msg), Some("z9hG4bK9".to_string()));
        assert_eq!(cseq_method(&msg), Some("INVITE".to_string()));
    }

    #[tokio::test]
    async fn stop_removes_transaction_and_signals_task() {
        let table = Arc::new(TransactionTable::new());
        let key = TransactionKey::new("z9hG4bK2", "INVITE");
        let response = SipMessage::response_default(pbx_sip::status::StatusCode::RINGING);
        table.start_server_transaction(key.clone(), TransactionKind::InviteServer, response, |_| async {});
        assert!(table.contains(&key));
        table.stop(&key);
        assert!(!table.contains(&key));
    }
}
