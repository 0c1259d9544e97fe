//! RTP packetizing, DTMF detection, and the RTP relay (§4.3, §4.4, §4.6).

pub mod dtmf;
pub mod error;
pub mod law;
pub mod packet;
pub mod player;
pub mod relay;

pub mod prelude {
    pub use crate::dtmf::{DtmfDetector, Rfc2833Decoder, StreamDtmfDetector, TelephoneEvent};
    pub use crate::error::{RtpError, RtpResult};
    pub use crate::packet::{RtpHeader, RtpPacket, RtpSender, SequenceGate, SAMPLES_PER_PACKET_8KHZ};
    pub use crate::player::{Player, Recorder};
    pub use crate::relay::{PortAllocator, RelayEntry, RtpRelay, DEFAULT_IDLE_TIMEOUT, DEFAULT_PORT_RANGE};
}
