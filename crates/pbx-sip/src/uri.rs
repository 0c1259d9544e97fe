//! A minimal SIP URI: just enough to extract the user part the dialplan
//! matches on (§4.10) and to round-trip through serialization.

use std::fmt;

use crate::error::{SipError, SipResult};

/// `sip:user@host:port;params` (or `sips:`). Only the pieces the core
/// actually inspects are modeled; everything else is kept as an opaque
/// parameter string so serialization is lossless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: String,
}

impl SipUri {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        SipUri { secure: false, user: Some(user.into()), host: host.into(), port: None, params: String::new() }
    }

    pub fn parse(s: &str) -> SipResult<Self> {
        let s = s.trim();
        let (secure, rest) = if let Some(r) = s.strip_prefix("sips:") {
            (true, r)
        } else if let Some(r) = s.strip_prefix("sip:") {
            (false, r)
        } else {
            return Err(SipError::BadUri(s.to_string()));
        };

        // Split off any URI parameters (after the first ';') before
        // looking for user@host, matching the teacher's URI parser order.
        let (authority, params) = match rest.find(';') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, String::new()),
        };

        let (user, hostport) = match authority.rfind('@') {
            Some(i) => (Some(authority[..i].to_string()), &authority[i + 1..]),
            None => (None, authority),
        };

        let (host, port) = match hostport.rfind(':') {
            Some(i) if hostport[i + 1..].chars().all(|c| c.is_ascii_digit()) && !hostport[i + 1..].is_empty() => {
                let port: u16 = hostport[i + 1..]
                    .parse()
                    .map_err(|_| SipError::BadUri(s.to_string()))?;
                (hostport[..i].to_string(), Some(port))
            }
            _ => (hostport.to_string(), None),
        };

        if host.is_empty() {
            return Err(SipError::BadUri(s.to_string()));
        }

        Ok(SipUri { secure, user, host, port, params })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}
