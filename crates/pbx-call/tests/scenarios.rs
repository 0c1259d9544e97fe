//! End-to-end scenario tests driving `PbxHandler`/`Router` the way a
//! real INVITE would, using real loopback sockets for the RTP relay.
//! The caller/callee phones themselves aren't simulated (see DESIGN.md's
//! B2BUA note) — each test drives the handler/manager/router directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pbx_call::call::{CallManager, CallState};
use pbx_call::cdr::NullCdrSink;
use pbx_call::external::{DirectoryEntry, ExtensionRegistry};
use pbx_call::handler_impl::PbxHandler;
use pbx_call::router::Router;
use pbx_dialog::auth::{compute_ha1, compute_response, FailureTracker};
use pbx_dialog::dialog::DialogTable;
use pbx_dialog::handler::SipRequestHandler;
use pbx_dialog::transaction::{self, TransactionKey, TransactionTable};
use pbx_media::prompts::PromptResolver;
use pbx_registrar::extension::Extension;
use pbx_registrar::registrar::Registrar;
use pbx_rtp::relay::RtpRelay;
use pbx_sip::message::SipMessage;
use pbx_sip::method::Method;
use pbx_sip::status::StatusCode;
use pbx_voicemail::sink::InMemorySink;
use tokio::net::UdpSocket;

struct NoExtensions;

#[async_trait]
impl ExtensionRegistry for NoExtensions {
    async fn get(&self, _number: &str) -> Option<DirectoryEntry> {
        None
    }
    async fn verify_credentials(&self, _number: &str, _password: &str) -> bool {
        false
    }
}

const REALM: &str = "pbx";
const PASSWORD: &str = "secret";

fn sdp_offer(port: u16) -> Vec<u8> {
    format!(
        "v=0\r\n\
o=caller 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio {port} RTP/AVP 0\r\n"
    )
    .into_bytes()
}

fn authorized_invite(from: &str, to: &str, call_id: &str, sdp_port: u16, ha1: &str) -> SipMessage {
    let uri = format!("sip:{to}@pbx.example.com");
    let nonce = "test-nonce";
    let response = compute_response(ha1, nonce, "INVITE", &uri);
    SipMessage::request(Method::Invite, uri.clone())
        .with_header("From", format!("<sip:{from}@pbx.example.com>;tag=abc"))
        .with_header("To", format!("<sip:{to}@pbx.example.com>"))
        .with_header("Call-ID", call_id)
        .with_header("CSeq", "1 INVITE")
        .with_header(
            "Authorization",
            format!(r#"Digest username="{from}", realm="{REALM}", nonce="{nonce}", uri="{uri}", response="{response}""#),
        )
        .with_body(sdp_offer(sdp_port))
}

struct Harness {
    handler: PbxHandler,
    call_manager: Arc<CallManager>,
    sink: Arc<InMemorySink>,
    registrar: Arc<Registrar>,
}

/// Stand-in for `SipTransport`'s recv loop against the router's own
/// outbound-leg socket: routes every response into `transactions` the
/// same way the real transport's `handle_datagram` does.
fn spawn_client_response_pump(socket: Arc<UdpSocket>, transactions: Arc<TransactionTable>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, _)) = socket.recv_from(&mut buf).await else { return };
            let Ok(message) = SipMessage::parse(&buf[..n]) else { continue };
            if message.is_request() {
                continue;
            }
            let Some(branch) = transaction::via_branch(&message) else { continue };
            let Some(method) = transaction::cseq_method(&message) else { continue };
            transactions.deliver_to_client(&TransactionKey::new(branch, method), message);
        }
    });
}

async fn build_harness(no_answer_timeout: Duration) -> Harness {
    let call_manager = Arc::new(CallManager::new());
    let registrar = Arc::new(Registrar::new(3600));
    let relay = Arc::new(RtpRelay::new("127.0.0.1".parse().unwrap(), 21_000, 21_100, pbx_rtp::relay::DEFAULT_IDLE_TIMEOUT));
    let sink = Arc::new(InMemorySink::default());
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let transactions = Arc::new(TransactionTable::new());
    spawn_client_response_pump(socket.clone(), transactions.clone());
    let router = Arc::new(Router::new(
        call_manager.clone(),
        registrar.clone(),
        relay.clone(),
        sink.clone(),
        Arc::new(PromptResolver::new(None)),
        Arc::new(NullCdrSink),
        socket,
        transactions,
        "127.0.0.1".to_string(),
        r"^\d{4}$",
        no_answer_timeout,
        120,
        Duration::from_millis(500),
        0,
    ));
    let dialogs = Arc::new(DialogTable::new(Duration::from_secs(32)));
    let failures = Arc::new(FailureTracker::new(3, Duration::from_secs(300)));

    let handler = PbxHandler {
        call_manager: call_manager.clone(),
        router,
        registrar: registrar.clone(),
        extensions: Arc::new(NoExtensions),
        relay,
        dialogs,
        cdr: Arc::new(NullCdrSink),
        failures,
        realm: REALM.to_string(),
        local_address: "127.0.0.1".to_string(),
        dtmf_payload_type: 101,
        ilbc_mode: 30,
    };

    Harness { handler, call_manager, sink, registrar }
}

fn caller_source() -> SocketAddr {
    "127.0.0.1:5999".parse().unwrap()
}

/// Reply to one INVITE arriving on `callee_socket` with 180 then 200,
/// simulating a registered extension that answers.
async fn answer_as_callee(callee_socket: UdpSocket) {
    let mut buf = vec![0u8; 4096];
    let (n, from) = callee_socket.recv_from(&mut buf).await.unwrap();
    let request = SipMessage::parse(&buf[..n]).unwrap();
    let via = request.header("via").unwrap().to_string();
    let call_id = request.header("call-id").unwrap().to_string();

    let ringing = SipMessage::response_default(StatusCode::RINGING)
        .with_header("Via", via.clone())
        .with_header("Call-ID", call_id.clone())
        .with_header("CSeq", "1 INVITE");
    callee_socket.send_to(&ringing.serialize(), from).await.unwrap();

    let ok = SipMessage::response_default(StatusCode::OK)
        .with_header("Via", via)
        .with_header("To", "<sip:1002@pbx.example.com>;tag=calleetag")
        .with_header("Call-ID", call_id)
        .with_header("CSeq", "1 INVITE")
        .with_header("Content-Type", "application/sdp")
        .with_body(sdp_offer(21_060))
        .serialize();
    callee_socket.send_to(&ok, from).await.unwrap();
}

/// Scenario 1: an internal call to a registered, answering extension
/// connects and never touches voicemail.
#[tokio::test]
async fn internal_call_to_answering_extension_connects_without_voicemail() {
    let harness = build_harness(Duration::from_millis(200)).await;
    let ha1 = compute_ha1("1001", REALM, PASSWORD);
    let mut ext = Extension::new("1001", "Alice", ha1.clone());
    ext.capabilities.has_voicemail = true;
    harness.registrar.provision(ext).unwrap();

    let callee_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee_addr = callee_socket.local_addr().unwrap();
    harness.registrar.provision(Extension::new("1002", "Bob", "unused-ha1")).unwrap();
    harness.registrar.register("1002", callee_addr, 3600).unwrap();
    tokio::spawn(answer_as_callee(callee_socket));

    let invite = authorized_invite("1001", "1002", "call-scenario-1", 21_050, &ha1);
    // The second leg is really rung and answered here, so this await
    // resolves only once the simulated extension's 200 OK arrives.
    let response = harness.handler.handle_invite(&invite, caller_source()).await;
    assert_eq!(response.response.status_code(), Some(200));

    let call = harness.call_manager.get("call-scenario-1").expect("call created");
    assert_eq!(call.state, CallState::Ringing);

    // The caller's own ACK is what actually connects its leg.
    harness.call_manager.connect("call-scenario-1").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let call = harness.call_manager.get("call-scenario-1").expect("call still active");
    assert_eq!(call.state, CallState::Connected);
    assert!(harness.sink.get_messages("1002", false).await.unwrap().is_empty(), "no voicemail should be deposited");
}

/// Scenario 2: an internal call to a registered extension that never
/// answers diverts to voicemail once the no-answer timeout fires, and a
/// `#` over SIP INFO ends the recording and deposits a message.
#[tokio::test]
async fn no_answer_diverts_to_voicemail_and_hash_ends_recording() {
    let harness = build_harness(Duration::from_millis(100)).await;
    let ha1 = compute_ha1("1001", REALM, PASSWORD);
    harness.registrar.provision(Extension::new("1001", "Alice", ha1.clone())).unwrap();

    // Bound but never read: the extension is registered yet never answers.
    let callee_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee_addr = callee_socket.local_addr().unwrap();
    harness.registrar.provision(Extension::new("1002", "Bob", "unused-ha1")).unwrap();
    harness.registrar.register("1002", callee_addr, 3600).unwrap();

    let invite = authorized_invite("1001", "1002", "call-scenario-2", 21_051, &ha1);
    // Resolves only after the no-answer timeout elapses inside route_internal.
    let response = harness.handler.handle_invite(&invite, caller_source()).await;
    assert_eq!(response.response.status_code(), Some(200));

    // Give the divert-to-voicemail task, spawned once the response above
    // went out, a moment to start its recording loop.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.call_manager.get("call-scenario-2").is_some(), "divert keeps the call alive while recording");

    harness.call_manager.push_dtmf("call-scenario-2", '#');
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(harness.call_manager.get("call-scenario-2").is_none(), "call ends once the recording is deposited");
    let messages = harness.sink.get_messages("1002", false).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].caller_id, "1001");
}

/// Scenario 4: a malformed SDP body in an INVITE is rejected with 400
/// and never creates a Call or allocates an RTP relay entry.
#[tokio::test]
async fn malformed_sdp_invite_is_rejected_and_creates_no_call() {
    let harness = build_harness(Duration::from_secs(25)).await;
    let ha1 = compute_ha1("1001", REALM, PASSWORD);
    harness.registrar.provision(Extension::new("1001", "Alice", ha1.clone())).unwrap();

    let uri = "sip:1002@pbx.example.com".to_string();
    let nonce = "test-nonce";
    let response = compute_response(&ha1, nonce, "INVITE", &uri);
    let invite = SipMessage::request(Method::Invite, uri.clone())
        .with_header("From", "<sip:1001@pbx.example.com>;tag=abc")
        .with_header("To", "<sip:1002@pbx.example.com>")
        .with_header("Call-ID", "call-scenario-4")
        .with_header("CSeq", "1 INVITE")
        .with_header(
            "Authorization",
            format!(r#"Digest username="1001", realm="{REALM}", nonce="{nonce}", uri="{uri}", response="{response}""#),
        )
        .with_body(b"this is not valid sdp at all".to_vec());

    let result = harness.handler.handle_invite(&invite, caller_source()).await;
    assert_eq!(result.response.status_code(), Some(400));
    assert!(harness.call_manager.get("call-scenario-4").is_none());
}
