//! SDP offer/answer handling (§4.2, RFC 4566 subset).
//!
//! Only what the PBX core needs is modeled: the origin line, the first
//! `m=audio` line and its payload types, the `c=` line that applies to
//! it, and `a=rtpmap`/`a=fmtp` for dynamic payload types. No video, no
//! SRTP (Non-goals).

use std::collections::BTreeMap;

use crate::error::{SipError, SipResult};

/// A dynamic payload type's `rtpmap` entry: `<encoding>/<clock-rate>[/<params>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub encoding: String,
    pub clock_rate: u32,
}

/// The parts of an SDP session this PBX actually inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub origin_address: String,
    pub session_id: String,
    pub connection_address: String,
    pub audio_port: u16,
    pub payload_types: Vec<u8>,
    pub rtpmap: BTreeMap<u8, RtpMap>,
    pub fmtp: BTreeMap<u8, String>,
}

impl SdpSession {
    /// The RFC 2833 `telephone-event` dynamic payload type, if offered.
    pub fn telephone_event_pt(&self) -> Option<u8> {
        self.rtpmap
            .iter()
            .find(|(_, m)| m.encoding.eq_ignore_ascii_case("telephone-event"))
            .map(|(pt, _)| *pt)
    }

    pub fn has_ilbc(&self) -> bool {
        self.rtpmap.values().any(|m| m.encoding.eq_ignore_ascii_case("ilbc"))
    }

    pub fn ilbc_pt(&self) -> Option<u8> {
        self.rtpmap
            .iter()
            .find(|(_, m)| m.encoding.eq_ignore_ascii_case("ilbc"))
            .map(|(pt, _)| *pt)
    }

    pub fn parse(body: &[u8]) -> SipResult<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|_| SipError::MalformedSdp("body is not valid UTF-8".to_string()))?;

        let mut origin_address = String::new();
        let mut session_id = String::new();
        let mut session_connection: Option<String> = None;
        let mut media_connection: Option<String> = None;
        let mut audio_port: Option<u16> = None;
        let mut payload_types: Vec<u8> = Vec::new();
        let mut rtpmap: BTreeMap<u8, RtpMap> = BTreeMap::new();
        let mut fmtp: BTreeMap<u8, String> = BTreeMap::new();
        let mut in_audio_media = false;

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r');
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                continue;
            }
            let (kind, value) = (line.as_bytes()[0], &line[2..]);

            match kind {
                b'o' => {
                    // o=<username> <sess-id> <sess-version> <nettype> <addrtype> <unicast-address>
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        session_id = parts[1].to_string();
                        origin_address = parts[5].to_string();
                    }
                }
                b'c' => {
                    // c=<nettype> <addrtype> <connection-address>
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        if in_audio_media {
                            media_connection = Some(parts[2].to_string());
                        } else {
                            session_connection = Some(parts[2].to_string());
                        }
                    }
                }
                b'm' => {
                    if in_audio_media {
                        // Already captured the first m=audio line; ignore
                        // any later media sections (single audio stream).
                        continue;
                    }
                    if let Some(rest) = value.strip_prefix("audio ") {
                        in_audio_media = true;
                        let parts: Vec<&str> = rest.split_whitespace().collect();
                        if parts.is_empty() {
                            return Err(SipError::MalformedSdp("m=audio missing port".to_string()));
                        }
                        let port: u16 = parts[0]
                            .parse()
                            .map_err(|_| SipError::MalformedSdp(format!("bad m=audio port {:?}", parts[0])))?;
                        audio_port = Some(port);
                        // parts[1] is the transport (RTP/AVP); payload types follow.
                        for pt_str in parts.iter().skip(2) {
                            if let Ok(pt) = pt_str.parse::<u8>() {
                                payload_types.push(pt);
                            }
                        }
                    }
                }
                b'a' if in_audio_media => {
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        let mut it = rest.splitn(2, ' ');
                        let pt: u8 = match it.next().and_then(|s| s.parse().ok()) {
                            Some(pt) => pt,
                            None => continue,
                        };
                        let desc = it.next().unwrap_or("");
                        let mut parts = desc.split('/');
                        let encoding = parts.next().unwrap_or("").to_string();
                        let clock_rate: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(8000);
                        rtpmap.insert(pt, RtpMap { encoding, clock_rate });
                    } else if let Some(rest) = value.strip_prefix("fmtp:") {
                        let mut it = rest.splitn(2, ' ');
                        if let Some(pt) = it.next().and_then(|s| s.parse::<u8>().ok()) {
                            fmtp.insert(pt, it.next().unwrap_or("").to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        let audio_port = audio_port.ok_or_else(|| SipError::MalformedSdp("no m=audio line found".to_string()))?;
        let connection_address = media_connection
            .or(session_connection)
            .ok_or_else(|| SipError::MalformedSdp("no c= line found".to_string()))?;

        Ok(SdpSession {
            origin_address,
            session_id,
            connection_address,
            audio_port,
            payload_types,
            rtpmap,
            fmtp,
        })
    }
}

/// Parameters needed to build an SDP answer (§4.2, §8 scenario 1: the
/// answer's payload-type set equals `L ∩ O` in offerer order).
pub struct AnswerParams<'a> {
    pub local_address: &'a str,
    pub local_port: u16,
    pub session_id: &'a str,
    pub supported: &'a [u8],
    /// Static codec name for each supported PT (for `a=rtpmap` when the PT
    /// is in the dynamic range, i.e. >= 96, or needs an explicit name).
    pub codec_names: &'a BTreeMap<u8, (String, u32)>,
    pub dtmf_payload_type: u8,
    pub ilbc_mode: u8,
}

/// Select `offer.payload_types ∩ supported`, preserving offerer order,
/// then build a complete SDP answer body.
pub fn build_answer(offer: &SdpSession, params: &AnswerParams<'_>) -> (Vec<u8>, String) {
    let selected: Vec<u8> = offer
        .payload_types
        .iter()
        .copied()
        .filter(|pt| params.supported.contains(pt))
        .collect();

    let telephone_event = offer.telephone_event_pt().map(|_| params.dtmf_payload_type);

    let mut pts = selected.clone();
    if let Some(te) = telephone_event {
        pts.push(te);
    }

    let mut body = String::new();
    body.push_str("v=0\r\n");
    body.push_str(&format!("o=pbx {} {} IN IP4 {}\r\n", params.session_id, params.session_id, params.local_address));
    body.push_str("s=pbx\r\n");
    body.push_str(&format!("c=IN IP4 {}\r\n", params.local_address));
    body.push_str("t=0 0\r\n");
    body.push_str(&format!(
        "m=audio {} RTP/AVP {}\r\n",
        params.local_port,
        pts.iter().map(u8::to_string).collect::<Vec<_>>().join(" ")
    ));

    for pt in &selected {
        if let Some((name, rate)) = params.codec_names.get(pt) {
            body.push_str(&format!("a=rtpmap:{} {}/{}\r\n", pt, name, rate));
            if name.eq_ignore_ascii_case("ilbc") {
                body.push_str(&format!("a=fmtp:{} mode={}\r\n", pt, params.ilbc_mode));
            }
        }
    }
    if let Some(te) = telephone_event {
        body.push_str(&format!("a=rtpmap:{} telephone-event/8000\r\n", te));
        body.push_str(&format!("a=fmtp:{} 0-15\r\n", te));
    }
    body.push_str("a=sendrecv\r\n");

    (selected, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=alice 12345 12345 IN IP4 192.168.1.10\r\n\
s=-\r\n\
c=IN IP4 192.168.1.10\r\n\
t=0 0\r\n\
m=audio 20000 RTP/AVP 0 8 101\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-15\r\n";

    #[test]
    fn parses_offer() {
        let sdp = SdpSession::parse(OFFER.as_bytes()).unwrap();
        assert_eq!(sdp.origin_address, "192.168.1.10");
        assert_eq!(sdp.connection_address, "192.168.1.10");
        assert_eq!(sdp.audio_port, 20000);
        assert_eq!(sdp.payload_types, vec![0, 8, 101]);
        assert_eq!(sdp.telephone_event_pt(), Some(101));
    }

    #[test]
    fn answer_intersects_in_offerer_order() {
        let sdp = SdpSession::parse(OFFER.as_bytes()).unwrap();
        let mut codec_names = BTreeMap::new();
        codec_names.insert(0u8, ("PCMU".to_string(), 8000u32));
        codec_names.insert(8u8, ("PCMA".to_string(), 8000u32));
        let params = AnswerParams {
            local_address: "10.0.0.1",
            local_port: 30000,
            session_id: "99",
            supported: &[8, 0],
            codec_names: &codec_names,
            dtmf_payload_type: 101,
            ilbc_mode: 30,
        };
        let (selected, body) = build_answer(&sdp, &params);
        assert_eq!(selected, vec![0, 8]);
        assert!(body.contains("m=audio 30000 RTP/AVP 0 8 101"));
    }
}
