//! SIP message parsing and serialization (§4.1).
//!
//! A message is a start-line, CRLF-separated headers, a blank line, and
//! an optional body. `Content-Length` is authoritative: if it disagrees
//! with the bytes actually available the message is rejected as
//! [`SipError::ContentLengthMismatch`] rather than silently truncated or
//! padded.

use bytes::Bytes;

use crate::error::{SipError, SipResult};
use crate::header::HeaderList;
use crate::method::{Method, KNOWN_METHODS};
use crate::status::StatusCode;

/// The discriminant between a request and a response start-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: String },
    Response { code: u16, reason: String },
}

/// A parsed SIP message: either a request or a response, uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: HeaderList,
    pub body: Bytes,
}

const CRLF: &str = "\r\n";

impl SipMessage {
    pub fn request(method: Method, uri: impl Into<String>) -> Self {
        SipMessage {
            start_line: StartLine::Request { method, uri: uri.into() },
            headers: HeaderList::new(),
            body: Bytes::new(),
        }
    }

    pub fn response(status: StatusCode, reason: impl Into<String>) -> Self {
        SipMessage {
            start_line: StartLine::Response { code: status.0, reason: reason.into() },
            headers: HeaderList::new(),
            body: Bytes::new(),
        }
    }

    /// Convenience: a response using the status code's default reason phrase.
    pub fn response_default(status: StatusCode) -> Self {
        Self::response(status, status.default_reason())
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers_all(&self, name: &str) -> Vec<&str> {
        self.headers.get_all(name)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a full message out of a UDP datagram's worth of bytes.
    pub fn parse(input: &[u8]) -> SipResult<Self> {
        let sep = find_subslice(input, b"\r\n\r\n").ok_or(SipError::MissingHeaderTerminator)?;
        let header_block = std::str::from_utf8(&input[..sep]).map_err(|_| {
            SipError::BadStartLine("non-UTF-8 header block".to_string())
        })?;
        let body = &input[sep + 4..];

        let mut lines = unfold_headers(header_block);
        if lines.is_empty() {
            return Err(SipError::BadStartLine(String::new()));
        }
        let start_line_raw = lines.remove(0);
        let start_line = parse_start_line(&start_line_raw)?;

        let mut headers = HeaderList::new();
        for line in lines {
            let idx = line.find(':').ok_or_else(|| SipError::BadHeaderLine(line.clone()))?;
            let name = line[..idx].trim().to_string();
            let value = line[idx + 1..].trim().to_string();
            headers.push(name, value);
        }

        if let Some(cl) = headers.get("Content-Length") {
            let declared: usize = cl
                .trim()
                .parse()
                .map_err(|_| SipError::BadContentLength(cl.to_string()))?;
            if declared != body.len() {
                return Err(SipError::ContentLengthMismatch { declared, actual: body.len() });
            }
        }

        Ok(SipMessage { start_line, headers, body: Bytes::copy_from_slice(body) })
    }

    /// Serialize back to wire bytes. `Content-Length` is always present
    /// and always matches `self.body`, but its position in the header
    /// block is preserved: updated in place if already set, appended
    /// only if the message never carried one.
    pub fn serialize(&self) -> Bytes {
        let mut headers = self.headers.clone();
        headers.set("Content-Length", self.body.len().to_string());

        let mut out = String::new();
        match &self.start_line {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{} {} SIP/2.0{CRLF}", method, uri));
            }
            StartLine::Response { code, reason } => {
                out.push_str(&format!("SIP/2.0 {} {}{CRLF}", code, reason));
            }
        }

        for h in headers.iter() {
            out.push_str(&format!("{}{CRLF}", h));
        }
        out.push_str(CRLF);

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        Bytes::from(bytes)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split the header block on CRLF, rejoining RFC 3261 line-folded
/// continuations (a line starting with space/tab belongs to the
/// previous header).
fn unfold_headers(block: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in block.split("\r\n") {
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !out.is_empty() {
            let last = out.last_mut().unwrap();
            last.push(' ');
            last.push_str(raw.trim_start());
        } else {
            out.push(raw.to_string());
        }
    }
    out
}

fn parse_start_line(line: &str) -> SipResult<StartLine> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code_str = parts.next().unwrap_or("");
        let reason = parts.next().unwrap_or("").to_string();
        let code: u16 = code_str.parse().map_err(|_| SipError::BadStartLine(line.to_string()))?;
        return Ok(StartLine::Response { code, reason });
    }

    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    if parts.len() != 3 || parts[2] != "SIP/2.0" {
        return Err(SipError::BadStartLine(line.to_string()));
    }
    if !KNOWN_METHODS.contains(&parts[0]) {
        return Err(SipError::BadStartLine(line.to_string()));
    }
    Ok(StartLine::Request { method: parts[0].parse().unwrap(), uri: parts[1].to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invite() {
        let raw = b"INVITE sip:bob@pbx SIP/2.0\r\nVia: SIP/2.0/UDP 1.1.1.1:5060\r\nCall-ID: abc123\r\nContent-Length: 3\r\n\r\nxyz";
        let msg = SipMessage::parse(raw).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(&Method::Invite));
        assert_eq!(msg.request_uri(), Some("sip:bob@pbx"));
        assert_eq!(msg.header("call-id"), Some("abc123"));
        assert_eq!(&msg.body[..], b"xyz");
    }

    #[test]
    fn rejects_content_length_mismatch() {
        let raw = b"INVITE sip:x SIP/2.0\r\nContent-Length: 10\r\n\r\nABC";
        let err = SipMessage::parse(raw).unwrap_err();
        assert_eq!(err, SipError::ContentLengthMismatch { declared: 10, actual: 3 });
    }

    #[test]
    fn rejects_missing_terminator() {
        let raw = b"INVITE sip:x SIP/2.0\r\nContent-Length: 0\r\n";
        assert_eq!(SipMessage::parse(raw).unwrap_err(), SipError::MissingHeaderTerminator);
    }

    #[test]
    fn rejects_bad_start_line() {
        let raw = b"GARBAGE\r\n\r\n";
        assert!(matches!(SipMessage::parse(raw), Err(SipError::BadStartLine(_))));
    }

    #[test]
    fn rejects_header_without_colon() {
        let raw = b"OPTIONS sip:x SIP/2.0\r\nNoColonHere\r\nContent-Length: 0\r\n\r\n";
        assert!(matches!(SipMessage::parse(raw), Err(SipError::BadHeaderLine(_))));
    }

    #[test]
    fn roundtrip_preserves_header_order_and_case() {
        let raw = b"REGISTER sip:pbx SIP/2.0\r\nVia: SIP/2.0/UDP a\r\nVia: SIP/2.0/UDP b\r\nFrom: <sip:a@x>\r\nContent-Length: 0\r\n\r\n";
        let msg = SipMessage::parse(raw).unwrap();
        let serialized = msg.serialize();
        let reparsed = SipMessage::parse(&serialized).unwrap();
        assert_eq!(msg, reparsed);
        assert_eq!(reparsed.headers_all("via"), vec!["SIP/2.0/UDP a", "SIP/2.0/UDP b"]);
    }

    #[test]
    fn serialize_updates_content_length_in_place_when_not_last() {
        let raw = b"REGISTER sip:pbx SIP/2.0\r\nVia: SIP/2.0/UDP a\r\nContent-Length: 0\r\nFrom: <sip:a@x>\r\n\r\n";
        let msg = SipMessage::parse(raw).unwrap();
        let serialized = msg.serialize();
        let text = std::str::from_utf8(&serialized).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "REGISTER sip:pbx SIP/2.0");
        assert_eq!(lines[1], "Via: SIP/2.0/UDP a");
        assert_eq!(lines[2], "Content-Length: 0");
        assert_eq!(lines[3], "From: <sip:a@x>");

        let reparsed = SipMessage::parse(&serialized).unwrap();
        assert_eq!(msg, reparsed);
    }

    #[test]
    fn serialize_appends_content_length_when_absent() {
        let msg = SipMessage::request(Method::Options, "sip:pbx").with_header("Via", "SIP/2.0/UDP a");
        let serialized = msg.serialize();
        let text = std::str::from_utf8(&serialized).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "OPTIONS sip:pbx SIP/2.0");
        assert_eq!(lines[1], "Via: SIP/2.0/UDP a");
        assert_eq!(lines[2], "Content-Length: 0");
    }

    proptest::proptest! {
        #[test]
        fn parse_of_serialize_is_identity(body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64)) {
            let msg = SipMessage::request(Method::Invite, "sip:bob@pbx")
                .with_header("Via", "SIP/2.0/UDP 1.1.1.1:5060;branch=z9hG4bKabc")
                .with_header("Call-ID", "cid-1")
                .with_body(body);
            let bytes = msg.serialize();
            let reparsed = SipMessage::parse(&bytes).unwrap();
            prop_assert_eq!(msg, reparsed);
        }
    }
}
