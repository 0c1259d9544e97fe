//! RTP relay: port allocation and two-way packet forwarding (§4.6).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RtpError, RtpResult};
use crate::packet::RtpPacket;

/// Default port range and idle timeout from §6/§4.6.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (10_000, 20_000);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// FIFO allocator over even ports in a range; the odd companion port is
/// implied (RTCP = RTP + 1) and never handed out on its own.
pub struct PortAllocator {
    free: VecDeque<u16>,
}

impl PortAllocator {
    pub fn new(low: u16, high: u16) -> Self {
        let free = (low..=high).step_by(2).collect();
        PortAllocator { free }
    }

    pub fn allocate(&mut self) -> RtpResult<u16> {
        self.free.pop_front().ok_or(RtpError::PortsExhausted)
    }

    pub fn release(&mut self, port: u16) {
        self.free.push_back(port);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// One call's forwarding state: which remote address has been learned
/// for each of the (at most two) legs seen on this socket so far.
struct Legs {
    addrs: [Option<SocketAddr>; 2],
}

impl Legs {
    fn new() -> Self {
        Legs { addrs: [None, None] }
    }

    /// Classify `src` as leg 0 or 1 (learning it if unseen), and return
    /// the address to forward to, if the other leg is already known.
    fn route(&mut self, src: SocketAddr) -> Option<SocketAddr> {
        let idx = if self.addrs[0] == Some(src) {
            0
        } else if self.addrs[1] == Some(src) {
            1
        } else if self.addrs[0].is_none() {
            self.addrs[0] = Some(src);
            0
        } else if self.addrs[1].is_none() {
            self.addrs[1] = Some(src);
            1
        } else {
            return None; // both legs already claimed by other addresses
        };
        self.addrs[1 - idx]
    }
}

/// A single call's relay entry: the socket it owns and the learned
/// leg addresses, plus idle-reclamation bookkeeping.
pub struct RelayEntry {
    pub rtp_port: u16,
    pub rtcp_port: u16,
    socket: Arc<UdpSocket>,
    legs: RwLock<Legs>,
    last_packet_at: AtomicI64,
    forward_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl RelayEntry {
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    fn touch(&self) {
        self.last_packet_at.store(now_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let elapsed_ms = now_millis() - self.last_packet_at.load(Ordering::Relaxed);
        Duration::from_millis(elapsed_ms.max(0) as u64)
    }

    /// Cancel the background `forward_loop` reading this entry's
    /// socket. Idempotent. Callers that hand the socket to a
    /// `Player`/`Recorder` (voicemail access, no-answer divert) must
    /// call this first, or the forwarder races them for packets.
    pub fn stop_forwarding(&self) {
        if let Some(handle) = self.forward_task.lock().take() {
            handle.abort();
        }
    }
}

/// Owns every call's relay entry and the port allocator.
pub struct RtpRelay {
    allocator: SyncMutex<PortAllocator>,
    entries: DashMap<String, Arc<RelayEntry>>,
    idle_timeout: Duration,
    bind_addr: std::net::IpAddr,
}

impl RtpRelay {
    pub fn new(bind_addr: std::net::IpAddr, low: u16, high: u16, idle_timeout: Duration) -> Self {
        RtpRelay {
            allocator: SyncMutex::new(PortAllocator::new(low, high)),
            entries: DashMap::new(),
            idle_timeout,
            bind_addr,
        }
    }

    /// Allocate a port pair and an open socket for `call_id`, and spawn
    /// its forwarding loop. Returns the (RTP, RTCP) port pair.
    pub async fn allocate(&self, call_id: &str) -> RtpResult<(u16, u16)> {
        let port = self.allocator.lock().allocate()?;
        let socket = match UdpSocket::bind((self.bind_addr, port)).await {
            Ok(s) => s,
            Err(e) => {
                self.allocator.lock().release(port);
                return Err(RtpError::Io(e.to_string()));
            }
        };
        let entry = Arc::new(RelayEntry {
            rtp_port: port,
            rtcp_port: port + 1,
            socket: Arc::new(socket),
            legs: RwLock::new(Legs::new()),
            last_packet_at: AtomicI64::new(now_millis()),
            forward_task: SyncMutex::new(None),
        });
        self.entries.insert(call_id.to_string(), entry.clone());
        info!(call_id, rtp_port = port, "allocated RTP relay entry");

        let handle = tokio::spawn(forward_loop(call_id.to_string(), entry.clone()));
        *entry.forward_task.lock() = Some(handle);
        Ok((port, port + 1))
    }

    pub fn entry(&self, call_id: &str) -> Option<Arc<RelayEntry>> {
        self.entries.get(call_id).map(|e| e.clone())
    }

    /// Release a call's port back to the pool. Idempotent.
    pub fn release(&self, call_id: &str) {
        if let Some((_, entry)) = self.entries.remove(call_id) {
            entry.stop_forwarding();
            self.allocator.lock().release(entry.rtp_port);
            debug!(call_id, "released RTP relay entry");
        }
    }

    /// Sweep all entries and release any idle past `idle_timeout`.
    /// Intended to run on a periodic `tokio::time::interval` (§4.6).
    pub fn sweep_idle(&self) {
        let idle_timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().idle_for() >= idle_timeout)
            .map(|e| e.key().clone())
            .collect();
        for call_id in stale {
            warn!(call_id, "reclaiming idle RTP relay entry");
            self.release(&call_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }
}

async fn forward_loop(call_id: String, entry: Arc<RelayEntry>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, src) = match entry.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(call_id, error = %e, "RTP relay socket read failed, stopping forwarder");
                return;
            }
        };
        entry.touch();

        let dest = {
            let mut legs = entry.legs.write().await;
            legs.route(src)
        };
        let Some(dest) = dest else {
            debug!(call_id, %src, "learned new leg, no peer to forward to yet");
            continue;
        };

        // Parsing validates the packet is well-formed RTP before we
        // bother forwarding it; malformed datagrams are just dropped.
        if RtpPacket::parse(&buf[..n]).is_err() {
            continue;
        }
        if let Err(e) = entry.socket.send_to(&buf[..n], dest).await {
            warn!(call_id, error = %e, "RTP relay forward failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_is_fifo_and_even_only() {
        let mut alloc = PortAllocator::new(10_000, 10_006);
        assert_eq!(alloc.allocate().unwrap(), 10_000);
        assert_eq!(alloc.allocate().unwrap(), 10_002);
        assert_eq!(alloc.allocate().unwrap(), 10_004);
        assert_eq!(alloc.allocate().unwrap(), 10_006);
        assert_eq!(alloc.allocate(), Err(RtpError::PortsExhausted));
        alloc.release(10_002);
        assert_eq!(alloc.allocate().unwrap(), 10_002);
    }

    #[test]
    fn legs_learn_and_route_both_directions() {
        let a: SocketAddr = "127.0.0.1:10000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:20000".parse().unwrap();
        let mut legs = Legs::new();
        assert_eq!(legs.route(a), None, "first packet, no peer learned yet");
        assert_eq!(legs.route(b), Some(a), "second leg learned, forward to first");
        assert_eq!(legs.route(a), Some(b));
        assert_eq!(legs.route(b), Some(a));
    }

    #[tokio::test]
    async fn allocate_binds_a_real_socket_and_forwards() {
        let relay = RtpRelay::new("127.0.0.1".parse().unwrap(), 18_000, 18_010, DEFAULT_IDLE_TIMEOUT);
        let (rtp_port, rtcp_port) = relay.allocate("call-1").await.unwrap();
        assert_eq!(rtcp_port, rtp_port + 1);
        assert!(relay.entry("call-1").is_some());
        relay.release("call-1");
        assert!(relay.entry("call-1").is_none());
    }

    #[tokio::test]
    async fn stop_forwarding_cancels_the_background_reader() {
        let relay = RtpRelay::new("127.0.0.1".parse().unwrap(), 18_020, 18_030, DEFAULT_IDLE_TIMEOUT);
        relay.allocate("call-2").await.unwrap();
        let entry = relay.entry("call-2").unwrap();

        entry.stop_forwarding();
        assert!(entry.forward_task.lock().is_none());

        // A second call is a no-op, not a double-abort panic.
        entry.stop_forwarding();
    }
}
