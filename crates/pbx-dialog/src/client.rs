//! Outbound UAC INVITE leg (§4.10's internal routing): the one place
//! this PBX originates a request instead of only answering one. Used
//! to ring a second call leg for real, with its own 100/180 before a
//! final response settles the first leg.

use std::net::SocketAddr;
use std::time::Duration;

use pbx_sip::message::SipMessage;
use pbx_sip::method::Method;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::auth::generate_nonce;
use crate::transaction::{TransactionKey, TransactionTable};

/// Timer B (RFC 3261 §17.1.1.2): give up on an outbound INVITE after
/// 64*T1 with no final response.
pub const INVITE_TIMEOUT: Duration = Duration::from_millis(64 * 500);

/// How an outbound INVITE transaction settled.
pub enum InviteOutcome {
    /// A final 2xx arrived; an ACK has already been sent for it.
    Answered(SipMessage),
    /// A final non-2xx arrived (busy, rejected, ...); ACKed already.
    Rejected(SipMessage),
    /// Timer B elapsed with nothing final.
    TimedOut,
}

/// Send an INVITE to `target` and drive its transaction to
/// completion: every provisional response is reported to
/// `on_provisional` as it arrives, then the call resolves to the
/// final outcome. `local_address` is this PBX's own address:port, used
/// for the Via/Contact this leg sends under. Gives up after `timeout`
/// (the caller's own no-answer policy; [`INVITE_TIMEOUT`] is a
/// reasonable ceiling to pass when nothing more specific applies).
#[allow(clippy::too_many_arguments)]
pub async fn invite(
    socket: &UdpSocket,
    transactions: &TransactionTable,
    target: SocketAddr,
    local_address: &str,
    call_id: &str,
    from_uri: &str,
    to_uri: &str,
    body: Vec<u8>,
    timeout: Duration,
    mut on_provisional: impl FnMut(&SipMessage),
) -> InviteOutcome {
    let branch = format!("z9hG4bK{}", generate_nonce());
    let from_tag = generate_nonce();

    let request = SipMessage::request(Method::Invite, to_uri)
        .with_header("Via", format!("SIP/2.0/UDP {local_address};branch={branch}"))
        .with_header("Max-Forwards", "70")
        .with_header("From", format!("<{from_uri}>;tag={from_tag}"))
        .with_header("To", format!("<{to_uri}>"))
        .with_header("Call-ID", call_id)
        .with_header("CSeq", "1 INVITE")
        .with_header("Contact", format!("<sip:{local_address}>"))
        .with_header("Content-Type", "application/sdp")
        .with_body(body);

    let key = TransactionKey::new(branch.clone(), "INVITE");
    let mut responses = transactions.register_client(key.clone());

    if let Err(e) = socket.send_to(&request.serialize(), target).await {
        transactions.forget_client(&key);
        debug!(%target, error = %e, "failed to send outbound INVITE");
        return InviteOutcome::TimedOut;
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                transactions.forget_client(&key);
                debug!(%target, %call_id, "outbound INVITE timed out waiting for a final response");
                return InviteOutcome::TimedOut;
            }
            response = responses.recv() => {
                let Some(response) = response else {
                    transactions.forget_client(&key);
                    return InviteOutcome::TimedOut;
                };
                let Some(code) = response.status_code() else { continue };
                if (100..200).contains(&code) {
                    on_provisional(&response);
                    continue;
                }

                transactions.forget_client(&key);
                send_ack(socket, target, &response, local_address, call_id, from_uri, &from_tag, to_uri).await;
                return if (200..300).contains(&code) {
                    InviteOutcome::Answered(response)
                } else {
                    InviteOutcome::Rejected(response)
                };
            }
        }
    }
}

/// ACK a final response: `To` carries the peer's tag from the
/// response itself, everything else mirrors the original INVITE.
#[allow(clippy::too_many_arguments)]
async fn send_ack(
    socket: &UdpSocket,
    target: SocketAddr,
    response: &SipMessage,
    local_address: &str,
    call_id: &str,
    from_uri: &str,
    from_tag: &str,
    to_uri: &str,
) {
    let to = response.header("to").unwrap_or(to_uri).to_string();
    let branch = format!("z9hG4bK{}", generate_nonce());
    let ack = SipMessage::request(Method::Ack, to_uri)
        .with_header("Via", format!("SIP/2.0/UDP {local_address};branch={branch}"))
        .with_header("Max-Forwards", "70")
        .with_header("From", format!("<{from_uri}>;tag={from_tag}"))
        .with_header("To", to)
        .with_header("Call-ID", call_id)
        .with_header("CSeq", "1 ACK");
    let _ = socket.send_to(&ack.serialize(), target).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbx_sip::status::StatusCode;
    use std::sync::Arc;

    /// Stand-in for `SipTransport`'s recv loop: reads responses off
    /// `socket` and routes them into `transactions`, same as the real
    /// transport does for an outbound leg's replies.
    fn spawn_response_pump(socket: Arc<UdpSocket>, transactions: Arc<TransactionTable>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let Ok((n, _)) = socket.recv_from(&mut buf).await else { return };
                let Ok(message) = SipMessage::parse(&buf[..n]) else { continue };
                if message.is_request() {
                    continue;
                }
                let Some(branch) = crate::transaction::via_branch(&message) else { continue };
                let Some(method) = crate::transaction::cseq_method(&message) else { continue };
                transactions.deliver_to_client(&TransactionKey::new(branch, method), message);
            }
        });
    }

    #[tokio::test]
    async fn invite_reports_provisional_then_resolves_to_final() {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = local.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let transactions = Arc::new(TransactionTable::new());
        spawn_response_pump(local.clone(), transactions.clone());

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (n, from) = peer.recv_from(&mut buf).await.unwrap();
            let request = SipMessage::parse(&buf[..n]).unwrap();
            let branch = crate::transaction::via_branch(&request).unwrap();

            let trying = SipMessage::response_default(StatusCode::TRYING)
                .with_header("Via", request.header("via").unwrap())
                .with_header("Call-ID", request.header("call-id").unwrap())
                .with_header("CSeq", "1 INVITE");
            peer.send_to(&trying.serialize(), from).await.unwrap();

            let ringing = SipMessage::response_default(StatusCode::RINGING)
                .with_header("Via", request.header("via").unwrap())
                .with_header("Call-ID", request.header("call-id").unwrap())
                .with_header("CSeq", "1 INVITE");
            peer.send_to(&ringing.serialize(), from).await.unwrap();

            let ok = SipMessage::response_default(StatusCode::OK)
                .with_header("Via", request.header("via").unwrap())
                .with_header("To", "<sip:bob@pbx>;tag=calleetag")
                .with_header("Call-ID", request.header("call-id").unwrap())
                .with_header("CSeq", "1 INVITE")
                .with_header("Content-Type", "application/sdp")
                .with_body(b"v=0\r\n".to_vec());
            peer.send_to(&ok.serialize(), from).await.unwrap();
            branch
        });

        let mut provisionals = Vec::new();
        let outcome = invite(
            &local,
            &transactions,
            peer_addr,
            &local_addr.to_string(),
            "call-xyz",
            "sip:alice@pbx",
            "sip:bob@pbx",
            Vec::new(),
            INVITE_TIMEOUT,
            |resp| provisionals.push(resp.status_code().unwrap()),
        )
        .await;

        responder.await.unwrap();
        assert_eq!(provisionals, vec![100, 180]);
        assert!(matches!(outcome, InviteOutcome::Answered(_)));
    }

    #[tokio::test]
    async fn invite_rejects_on_a_final_non_2xx() {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = local.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let transactions = Arc::new(TransactionTable::new());
        spawn_response_pump(local.clone(), transactions.clone());

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (n, from) = peer.recv_from(&mut buf).await.unwrap();
            let request = SipMessage::parse(&buf[..n]).unwrap();
            let busy = SipMessage::response_default(StatusCode::BUSY_HERE)
                .with_header("Via", request.header("via").unwrap())
                .with_header("Call-ID", request.header("call-id").unwrap())
                .with_header("CSeq", "1 INVITE");
            peer.send_to(&busy.serialize(), from).await.unwrap();
        });

        let outcome = invite(
            &local,
            &transactions,
            peer_addr,
            &local_addr.to_string(),
            "call-busy",
            "sip:alice@pbx",
            "sip:bob@pbx",
            Vec::new(),
            INVITE_TIMEOUT,
            |_| {},
        )
        .await;

        assert!(matches!(outcome, InviteOutcome::Rejected(r) if r.status_code() == Some(486)));
    }

    #[tokio::test]
    async fn invite_times_out_when_nothing_final_arrives() {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = local.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let transactions = Arc::new(TransactionTable::new());
        spawn_response_pump(local.clone(), transactions.clone());
        // Nothing reads `peer`, so no response is ever sent back.

        let outcome = invite(
            &local,
            &transactions,
            peer_addr,
            &local_addr.to_string(),
            "call-silent",
            "sip:alice@pbx",
            "sip:bob@pbx",
            Vec::new(),
            Duration::from_millis(50),
            |_| {},
        )
        .await;

        assert!(matches!(outcome, InviteOutcome::TimedOut));
        drop(peer);
    }
}
