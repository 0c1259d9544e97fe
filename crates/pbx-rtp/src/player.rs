//! Player/Recorder: the relay acting as a speaker/listener instead of a
//! forwarder, for voicemail IVR sessions (§4.6 last paragraph).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::error::{RtpError, RtpResult};
use crate::packet::{RtpPacket, RtpSender, SAMPLES_PER_PACKET_8KHZ};

/// Sends prompt audio to the caller, owning RTP timestamp/sequence
/// generation so every outbound packet is correctly paced.
pub struct Player {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    sender: Mutex<RtpSender>,
}

impl Player {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr, ssrc: u32, payload_type: u8) -> Self {
        Player { socket, remote, sender: Mutex::new(RtpSender::new(ssrc, payload_type, SAMPLES_PER_PACKET_8KHZ)) }
    }

    /// Send `frames`, each one 20 ms (160 bytes for an 8 kHz codec) of
    /// already-encoded payload, at the RTP cadence.
    pub async fn play_frames(&self, frames: &[Bytes]) -> RtpResult<()> {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(20));
        for (i, frame) in frames.iter().enumerate() {
            interval.tick().await;
            let marker = i == 0;
            let packet = { self.sender.lock().await.next_packet(frame.clone(), marker) };
            self.send(&packet).await?;
        }
        Ok(())
    }

    async fn send(&self, packet: &RtpPacket) -> RtpResult<()> {
        self.socket
            .send_to(&packet.serialize(), self.remote)
            .await
            .map(|_| ())
            .map_err(|e| RtpError::Io(e.to_string()))
    }
}

/// Accumulates caller audio into a growable buffer for later WAV
/// wrapping (§4.6, §4.11 recording completion).
pub struct Recorder {
    socket: Arc<UdpSocket>,
    buffer: Mutex<Vec<u8>>,
}

impl Recorder {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Recorder { socket, buffer: Mutex::new(Vec::new()) }
    }

    /// Read and append one packet's payload. Returns the payload bytes
    /// appended, for callers (like the IVR's in-band DTMF pass) that
    /// want to inspect the tail without re-reading the whole buffer.
    pub async fn recv_once(&self) -> RtpResult<Bytes> {
        let mut buf = vec![0u8; 2048];
        let (n, _src) = self.socket.recv_from(&mut buf).await.map_err(|e| RtpError::Io(e.to_string()))?;
        let packet = RtpPacket::parse(&buf[..n])?;
        let mut guard = self.buffer.lock().await;
        guard.extend_from_slice(&packet.payload);
        Ok(packet.payload)
    }

    /// Snapshot of everything recorded so far.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.buffer.lock().await.clone()
    }

    /// Clear the buffer (§4.11: cleared after any digit is acted on, so
    /// the tone's echo isn't mistaken for a second keypress).
    pub async fn clear(&self) {
        self.buffer.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorder_accumulates_and_clears() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = socket.local_addr().unwrap();
        let recorder = Recorder::new(socket);

        let packet = RtpPacket {
            header: crate::packet::RtpHeader {
                version: 2, padding: false, extension: false, marker: false,
                payload_type: 0, sequence_number: 1, timestamp: 0, ssrc: 7, csrc: vec![],
            },
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        peer.send_to(&packet.serialize(), local_addr).await.unwrap();
        recorder.recv_once().await.unwrap();
        assert_eq!(recorder.len().await, 3);
        recorder.clear().await;
        assert_eq!(recorder.len().await, 0);
    }
}
