//! RTP packet encode/decode (§4.3, RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! |V=2|P|X|  CC   |M|     PT      |       sequence number        |
//! |                           timestamp                          |
//! |                              SSRC                             |
//! |                  CSRC list (0..15 x 32 bits)                 |
//! ```

use bytes::{Bytes, BytesMut};

use crate::error::{RtpError, RtpResult};

pub const FIXED_HEADER_LEN: usize = 12;

/// Payload type for PCMU (§6: static PT 0).
pub const PT_PCMU: u8 = 0;
/// Payload type for PCMA (§6: static PT 8).
pub const PT_PCMA: u8 = 8;
/// Payload type for G.729, pass-through only (§6: static PT 18).
pub const PT_G729: u8 = 18;

/// Samples per 20 ms packet at 8 kHz, the cadence every codec here uses (§4.3).
pub const SAMPLES_PER_PACKET_8KHZ: u32 = 160;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

impl RtpHeader {
    pub fn len_bytes(&self) -> usize {
        FIXED_HEADER_LEN + self.csrc.len() * 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(buf: &[u8]) -> RtpResult<Self> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(RtpError::PacketTooShort(buf.len()));
        }
        let b0 = buf[0];
        let version = b0 >> 6;
        if version != 2 {
            return Err(RtpError::UnsupportedVersion(version));
        }
        let padding = (b0 & 0x20) != 0;
        let extension = (b0 & 0x10) != 0;
        let cc = (b0 & 0x0F) as usize;

        let b1 = buf[1];
        let marker = (b1 & 0x80) != 0;
        let payload_type = b1 & 0x7F;

        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let header_len = FIXED_HEADER_LEN + cc * 4;
        if buf.len() < header_len {
            return Err(RtpError::PacketTooShort(buf.len()));
        }
        let mut csrc = Vec::with_capacity(cc);
        for i in 0..cc {
            let off = FIXED_HEADER_LEN + i * 4;
            csrc.push(u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]));
        }

        let mut payload_start = header_len;
        let mut payload_end = buf.len();
        if padding && payload_end > payload_start {
            let pad_len = buf[buf.len() - 1] as usize;
            if pad_len <= payload_end - payload_start {
                payload_end -= pad_len;
            }
        }
        // Extension header parsing is intentionally not supported: no
        // extensions are negotiated by this PBX (Non-goals).
        if extension && payload_start + 4 <= payload_end {
            let ext_len_words = u16::from_be_bytes([buf[payload_start + 2], buf[payload_start + 3]]) as usize;
            payload_start += 4 + ext_len_words * 4;
        }
        if payload_start > payload_end {
            payload_start = payload_end;
        }

        Ok(RtpPacket {
            header: RtpHeader {
                version,
                padding: false,
                extension: false,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrc,
            },
            payload: Bytes::copy_from_slice(&buf[payload_start..payload_end]),
        })
    }

    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header.len_bytes() + self.payload.len());
        let h = &self.header;
        let b0 = (h.version << 6)
            | ((h.padding as u8) << 5)
            | ((h.extension as u8) << 4)
            | (h.csrc.len() as u8 & 0x0F);
        out.extend_from_slice(&[b0]);
        let b1 = ((h.marker as u8) << 7) | (h.payload_type & 0x7F);
        out.extend_from_slice(&[b1]);
        out.extend_from_slice(&h.sequence_number.to_be_bytes());
        out.extend_from_slice(&h.timestamp.to_be_bytes());
        out.extend_from_slice(&h.ssrc.to_be_bytes());
        for c in &h.csrc {
            out.extend_from_slice(&c.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);
        out.freeze()
    }
}

/// Generates outbound RTP packets for one stream: strictly increasing
/// sequence numbers, timestamps stepped by `samples_per_packet` (§4.3,
/// §8 quantified invariant on the Player's cadence).
#[derive(Debug, Clone)]
pub struct RtpSender {
    pub ssrc: u32,
    pub payload_type: u8,
    pub samples_per_packet: u32,
    sequence_number: u16,
    timestamp: u32,
}

impl RtpSender {
    pub fn new(ssrc: u32, payload_type: u8, samples_per_packet: u32) -> Self {
        let mut rng_seed = ssrc.wrapping_mul(2654435761);
        rng_seed ^= rng_seed >> 13;
        RtpSender {
            ssrc,
            payload_type,
            samples_per_packet,
            sequence_number: (rng_seed & 0xFFFF) as u16,
            timestamp: rng_seed,
        }
    }

    /// Build the next packet in sequence and advance the sender's state.
    pub fn next_packet(&mut self, payload: Bytes, marker: bool) -> RtpPacket {
        let packet = RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                marker,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                csrc: Vec::new(),
            },
            payload,
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_packet);
        packet
    }
}

/// Receive-side sequencing gate (§4.3): packets whose sequence number
/// jumps by more than 3000 from the last accepted one, in either
/// direction, are treated as an ambiguous wrap and dropped; everything
/// else (including ordinary reordering) is forwarded.
#[derive(Debug, Default)]
pub struct SequenceGate {
    last_seq: Option<u16>,
}

const MAX_SEQUENCE_DELTA: i32 = 3000;

impl SequenceGate {
    pub fn new() -> Self {
        SequenceGate { last_seq: None }
    }

    /// Returns `true` if the packet should be forwarded.
    pub fn accept(&mut self, seq: u16) -> bool {
        let Some(last) = self.last_seq else {
            self.last_seq = Some(seq);
            return true;
        };
        // Shortest signed distance around the 16-bit sequence circle.
        let delta = seq.wrapping_sub(last) as i16 as i32;
        if delta.abs() > MAX_SEQUENCE_DELTA {
            return false;
        }
        if delta > 0 {
            self.last_seq = Some(seq);
        }
        true
    }
}
