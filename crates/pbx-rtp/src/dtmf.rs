//! DTMF detection: in-band Goertzel (§4.4) and out-of-band RFC 2833 decode.

use std::f64::consts::PI;

/// Low-group and high-group DTMF frequencies (Hz).
pub const LOW_FREQS: [u32; 4] = [697, 770, 852, 941];
pub const HIGH_FREQS: [u32; 4] = [1209, 1336, 1477, 1633];

/// Samples per Goertzel frame. 205 at 8 kHz keeps every DTMF frequency's
/// bin within ±0.5 of an integer (§4.4), matching the frame size this
/// PBX's original detector used.
pub const SAMPLES_PER_FRAME: usize = 205;

/// Minimum accumulated audio before `detect_tone` will report anything (§4.4).
pub const MIN_DETECTION_BYTES: usize = 1600;

fn digit_for(low: u32, high: u32) -> char {
    match (low, high) {
        (697, 1209) => '1', (697, 1336) => '2', (697, 1477) => '3', (697, 1633) => 'A',
        (770, 1209) => '4', (770, 1336) => '5', (770, 1477) => '6', (770, 1633) => 'B',
        (852, 1209) => '7', (852, 1336) => '8', (852, 1477) => '9', (852, 1633) => 'C',
        (941, 1209) => '*', (941, 1336) => '0', (941, 1477) => '#', (941, 1633) => 'D',
        _ => unreachable!("caller only passes frequencies from LOW_FREQS/HIGH_FREQS"),
    }
}

/// Goertzel-algorithm DTMF tone detector over fixed-length frames.
#[derive(Debug, Clone)]
pub struct DtmfDetector {
    frame_size: usize,
    /// Absolute magnitude a frequency must exceed to be considered present.
    pub threshold: f64,
    /// How much the winning frequency must dominate the runner-up in its
    /// group (low vs low, high vs high) to count as a clean single tone.
    pub dominance_ratio: f64,
    low_coeffs: [f64; 4],
    high_coeffs: [f64; 4],
}

impl DtmfDetector {
    pub fn new() -> Self {
        Self::with_frame_size(SAMPLES_PER_FRAME)
    }

    pub fn with_frame_size(frame_size: usize) -> Self {
        let coeff = |freq: u32| -> f64 {
            let k = (0.5 + (frame_size as f64 * freq as f64 / 8000.0)).floor();
            let omega = (2.0 * PI * k) / frame_size as f64;
            2.0 * omega.cos()
        };
        DtmfDetector {
            frame_size,
            threshold: 4.0,
            dominance_ratio: 3.0,
            low_coeffs: LOW_FREQS.map(coeff),
            high_coeffs: HIGH_FREQS.map(coeff),
        }
    }

    fn goertzel(coeff: f64, samples: &[f64]) -> f64 {
        let (mut q1, mut q2) = (0.0, 0.0);
        for &s in samples {
            let q0 = coeff * q1 - q2 + s;
            q2 = q1;
            q1 = q0;
        }
        (q1 * q1 + q2 * q2 - q1 * q2 * coeff).max(0.0).sqrt()
    }

    /// Detect a single tone in one `frame_size`-sample (or longer, only
    /// the first `frame_size` samples are used) window of normalized
    /// `f64` PCM samples in `[-1.0, 1.0]`.
    pub fn detect_tone(&self, samples: &[f64]) -> Option<char> {
        if samples.len() < self.frame_size {
            return None;
        }
        let frame = &samples[..self.frame_size];

        let low_mags: Vec<f64> = self.low_coeffs.iter().map(|&c| Self::goertzel(c, frame)).collect();
        let high_mags: Vec<f64> = self.high_coeffs.iter().map(|&c| Self::goertzel(c, frame)).collect();

        let strongest = |mags: &[f64]| -> (usize, f64, f64) {
            let mut idx = 0;
            let mut top = mags[0];
            for (i, &m) in mags.iter().enumerate().skip(1) {
                if m > top {
                    top = m;
                    idx = i;
                }
            }
            let runner_up = mags.iter().enumerate().filter(|(i, _)| *i != idx).map(|(_, &m)| m).fold(0.0, f64::max);
            (idx, top, runner_up)
        };

        let (low_idx, low_top, low_runner_up) = strongest(&low_mags);
        let (high_idx, high_top, high_runner_up) = strongest(&high_mags);

        let low_ok = low_top > self.threshold && low_top > low_runner_up * self.dominance_ratio;
        let high_ok = high_top > self.threshold && high_top > high_runner_up * self.dominance_ratio;

        if low_ok && high_ok {
            Some(digit_for(LOW_FREQS[low_idx], HIGH_FREQS[high_idx]))
        } else {
            None
        }
    }

    /// Convert raw μ-law bytes to normalized `f64` samples and run
    /// [`Self::detect_tone`], honoring the §4.4 minimum-bytes gate.
    pub fn detect_tone_ulaw(&self, ulaw: &[u8]) -> Option<char> {
        if ulaw.len() < MIN_DETECTION_BYTES {
            return None;
        }
        let samples: Vec<f64> = ulaw.iter().map(|&b| crate::law::ulaw_decode(b) as f64 / 32768.0).collect();
        self.detect_tone(&samples)
    }
}

impl Default for DtmfDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-mode wrapper (§4.4): debounces so the same digit held across
/// consecutive frames is reported once, until a silent frame intervenes.
#[derive(Debug, Default)]
pub struct StreamDtmfDetector {
    detector: DtmfDetector,
    last_digit: Option<char>,
}

impl StreamDtmfDetector {
    pub fn new() -> Self {
        StreamDtmfDetector { detector: DtmfDetector::new(), last_digit: None }
    }

    /// Feed one frame's worth of normalized samples. Returns `Some(digit)`
    /// only the first time a new digit appears.
    pub fn push_frame(&mut self, samples: &[f64]) -> Option<char> {
        match self.detector.detect_tone(samples) {
            Some(d) if self.last_digit != Some(d) => {
                self.last_digit = Some(d);
                Some(d)
            }
            Some(_) => None,
            None => {
                self.last_digit = None;
                None
            }
        }
    }
}

/// RFC 2833 telephone-event payload layout (§4.4):
/// `event(8) | E(1) R(1) volume(6) | duration(16)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end_of_event: bool,
    pub volume: u8,
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }
        Some(TelephoneEvent {
            event: payload[0],
            end_of_event: (payload[1] & 0x80) != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    /// Map the RFC 2833 event code (0-15) to a keypad digit.
    pub fn digit(&self) -> Option<char> {
        match self.event {
            0..=9 => Some((b'0' + self.event) as char),
            10 => Some('*'),
            11 => Some('#'),
            12..=15 => Some((b'A' + (self.event - 12)) as char),
            _ => None,
        }
    }
}

/// Tracks the current telephone-event "id" (its RTP timestamp) so
/// repeated packets for the same event report only once (§4.4).
#[derive(Debug, Default)]
pub struct Rfc2833Decoder {
    current_event_timestamp: Option<u32>,
    reported: bool,
}

impl Rfc2833Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `timestamp` is the RTP packet timestamp, constant across all
    /// packets belonging to one DTMF event per RFC 2833.
    pub fn process(&mut self, timestamp: u32, event: &TelephoneEvent) -> Option<char> {
        if self.current_event_timestamp != Some(timestamp) {
            self.current_event_timestamp = Some(timestamp);
            self.reported = false;
        }
        if self.reported {
            return None;
        }
        self.reported = true;
        event.digit()
    }
}

/// Synthesize a DTMF tone as signed 16-bit PCM samples, for tests and
/// for §4.5's synthetic-tone fallback.
pub fn generate_tone(digit: char, sample_rate: u32, duration_ms: u32) -> Vec<i16> {
    let Some((low, high)) = DTMF_PAIRS.iter().find(|(d, _, _)| *d == digit).map(|(_, l, h)| (*l, *h)) else {
        return Vec::new();
    };
    let n = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
    (0..n)
        .map(|i| {
            let t = i as f64 / sample_rate as f64;
            let s = ((2.0 * PI * low as f64 * t).sin() + (2.0 * PI * high as f64 * t).sin()) / 2.0;
            (s * i16::MAX as f64 * 0.8) as i16
        })
        .collect()
}

const DTMF_PAIRS: [(char, u32, u32); 16] = [
    ('1', 697, 1209), ('2', 697, 1336), ('3', 697, 1477), ('A', 697, 1633),
    ('4', 770, 1209), ('5', 770, 1336), ('6', 770, 1477), ('B', 770, 1633),
    ('7', 852, 1209), ('8', 852, 1336), ('9', 852, 1477), ('C', 852, 1633),
    ('*', 941, 1209), ('0', 941, 1336), ('#', 941, 1477), ('D', 941, 1633),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_samples(digit: char, n: usize) -> Vec<f64> {
        let (low, high) = DTMF_PAIRS.iter().find(|(d, _, _)| *d == digit).map(|(_, l, h)| (*l, *h)).unwrap();
        (0..n)
            .map(|i| {
                let t = i as f64 / 8000.0;
                ((2.0 * PI * low as f64 * t).sin() + (2.0 * PI * high as f64 * t).sin()) / 2.0
            })
            .collect()
    }

    #[test]
    fn detects_pure_tone() {
        let detector = DtmfDetector::new();
        for digit in ['1', '5', '9', '*', '0', '#'] {
            let samples = tone_samples(digit, SAMPLES_PER_FRAME * 2);
            assert_eq!(detector.detect_tone(&samples), Some(digit), "digit {digit}");
        }
    }

    #[test]
    fn silence_reports_nothing() {
        let detector = DtmfDetector::new();
        let samples = vec![0.0f64; SAMPLES_PER_FRAME * 2];
        assert_eq!(detector.detect_tone(&samples), None);
    }

    #[test]
    fn ulaw_silence_below_threshold_bytes_reports_nothing() {
        let detector = DtmfDetector::new();
        let silence = vec![0x7Fu8; MIN_DETECTION_BYTES];
        assert_eq!(detector.detect_tone_ulaw(&silence), None);
    }

    #[test]
    fn stream_detector_debounces_until_silence() {
        let mut stream = StreamDtmfDetector::new();
        let tone = tone_samples('5', SAMPLES_PER_FRAME);
        let silence = vec![0.0f64; SAMPLES_PER_FRAME];

        assert_eq!(stream.push_frame(&tone), Some('5'));
        assert_eq!(stream.push_frame(&tone), None, "same digit held, should debounce");
        assert_eq!(stream.push_frame(&silence), None);
        assert_eq!(stream.push_frame(&tone), Some('5'), "silence reset allows re-report");
    }

    #[test]
    fn rfc2833_suppresses_duplicates_within_event() {
        let mut decoder = Rfc2833Decoder::new();
        let event = TelephoneEvent { event: 1, end_of_event: false, volume: 10, duration: 160 };
        assert_eq!(decoder.process(16000, &event), Some('1'));
        assert_eq!(decoder.process(16000, &event), None);
        let end_event = TelephoneEvent { end_of_event: true, ..event };
        assert_eq!(decoder.process(16000, &end_event), None, "still the same event id");
        assert_eq!(decoder.process(16160, &event), Some('1'), "new event timestamp reports again");
    }

    #[test]
    fn telephone_event_digit_mapping_covers_0_to_d() {
        let expected = "0123456789*#ABCD";
        for (event, ch) in expected.chars().enumerate() {
            // events are ordered 0-9,*,#,A-D per RFC 2833 Table 7
            let mapped_event = match ch {
                '*' => 10, '#' => 11,
                'A'..='D' => 12 + (ch as u8 - b'A'),
                d => d.to_digit(10).unwrap() as u8,
            };
            let te = TelephoneEvent { event: mapped_event, end_of_event: true, volume: 0, duration: 0 };
            assert_eq!(te.digit(), Some(ch), "event index {event}");
        }
    }
}
