//! `Extension`: number, display name, credentials, registration
//! binding, capability flags (§3).

use std::net::SocketAddr;
use std::time::Instant;

/// A network address/expiry pair recorded when an extension
/// registers. NAT-tolerant: the address is the datagram's source
/// address, not whatever the client claimed in its Contact URI.
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub address: SocketAddr,
    pub expires_at: Instant,
}

impl Binding {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Feature flags an extension may have independent of registration
/// state (e.g. whether it is allowed to act as an auto-attendant
/// target or hold a voicemail box).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub has_voicemail: bool,
    pub can_page: bool,
}

#[derive(Debug, Clone)]
pub struct Extension {
    pub number: String,
    pub display_name: String,
    /// HA1 = MD5(number:realm:password); see `pbx_dialog::auth`.
    pub ha1: String,
    pub binding: Option<Binding>,
    pub capabilities: Capabilities,
}

impl Extension {
    pub fn new(number: impl Into<String>, display_name: impl Into<String>, ha1: impl Into<String>) -> Self {
        Extension {
            number: number.into(),
            display_name: display_name.into(),
            ha1: ha1.into(),
            binding: None,
            capabilities: Capabilities::default(),
        }
    }

    pub fn is_registered(&self, now: Instant) -> bool {
        self.binding.map(|b| !b.is_expired(now)).unwrap_or(false)
    }
}
