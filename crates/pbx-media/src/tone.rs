//! Synthetic tone generation: single-frequency beeps and DTMF digits,
//! encoded straight to mu-law payload bytes ready for `RtpSender` (§4.5).

use std::f64::consts::PI;

use crate::law::ulaw_encode;
use crate::wav::SAMPLE_RATE_HZ;

/// Generate `duration_ms` of a single sine tone at `freq_hz`, mu-law
/// encoded. Used for the `beep` prompt and any other plain tone.
pub fn beep_mulaw(freq_hz: f64, duration_ms: u32) -> Vec<u8> {
    let n = (SAMPLE_RATE_HZ as u64 * duration_ms as u64 / 1000) as usize;
    (0..n)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE_HZ as f64;
            let sample = (2.0 * PI * freq_hz * t).sin() * i16::MAX as f64 * 0.8;
            ulaw_encode(sample as i16)
        })
        .collect()
}

/// Generate `duration_ms` of a DTMF digit tone, mu-law encoded.
/// Delegates the dual-frequency synthesis to the RTP crate's
/// generator so the exact frequency table is defined once.
pub fn dtmf_digit_mulaw(digit: char, duration_ms: u32) -> Vec<u8> {
    pbx_rtp::dtmf::generate_tone(digit, SAMPLE_RATE_HZ, duration_ms)
        .into_iter()
        .map(ulaw_encode)
        .collect()
}

/// The standard `beep` prompt used before voicemail recording (§4.11).
pub fn standard_beep() -> Vec<u8> {
    beep_mulaw(1000.0, 200)
}
