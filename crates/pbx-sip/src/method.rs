//! SIP request methods (§6: REGISTER, INVITE, ACK, BYE, CANCEL, INFO, OPTIONS).

use std::fmt;
use std::str::FromStr;

/// A SIP method. `Other` preserves whatever token the peer sent so that
/// serialization round-trips even for methods this PBX doesn't act on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Info,
    Options,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Info => "INFO",
            Method::Options => "OPTIONS",
            Method::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "INFO" => Method::Info,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        })
    }
}

/// Methods this PBX recognizes as valid start-line tokens (§4.1: a
/// start line must be "a known method" or a status line). `Other` is
/// still accepted as a forward-compatible catch-all, matching the
/// teacher's lenient SIP parser.
pub const KNOWN_METHODS: &[&str] = &[
    "REGISTER", "INVITE", "ACK", "BYE", "CANCEL", "INFO", "OPTIONS",
    "SUBSCRIBE", "NOTIFY", "REFER", "MESSAGE", "PRACK", "UPDATE", "PUBLISH",
];
