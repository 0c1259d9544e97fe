//! REGISTER processing and the binding table (§4.9).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use pbx_dialog::auth::verify_response;
use tracing::{debug, info};

use crate::error::{RegistrarError, RegistrarResult};
use crate::extension::{Binding, Extension};

pub const DEFAULT_MAX_EXPIRES: u32 = 3600;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The outcome of a REGISTER request, already reduced to what the
/// caller needs to build the 200 OK's Contact header.
pub struct RegisterOutcome {
    pub contact_address: Option<SocketAddr>,
    pub granted_expires: u32,
}

/// Concurrent extension table plus binding lifecycle.
pub struct Registrar {
    extensions: DashMap<String, Extension>,
    max_expires: u32,
}

impl Registrar {
    pub fn new(max_expires: u32) -> Self {
        Registrar { extensions: DashMap::new(), max_expires }
    }

    pub fn provision(&self, extension: Extension) -> RegistrarResult<()> {
        if self.extensions.contains_key(&extension.number) {
            return Err(RegistrarError::DuplicateExtension(extension.number));
        }
        self.extensions.insert(extension.number.clone(), extension);
        Ok(())
    }

    pub fn lookup(&self, number: &str) -> Option<Extension> {
        self.extensions.get(number).map(|e| e.clone())
    }

    pub fn ha1_for(&self, number: &str) -> Option<String> {
        self.extensions.get(number).map(|e| e.ha1.clone())
    }

    /// Verify a digest response against the extension's stored HA1.
    pub fn authenticate(&self, number: &str, nonce: &str, method: &str, uri: &str, response: &str) -> bool {
        match self.ha1_for(number) {
            Some(ha1) => verify_response(&ha1, nonce, method, uri, response),
            None => false,
        }
    }

    /// Process a REGISTER for `number` from `source`. `requested_expires
    /// = 0` removes the binding. Otherwise the binding is
    /// inserted/refreshed with `min(requested, max_expires)` (§4.9).
    pub fn register(&self, number: &str, source: SocketAddr, requested_expires: u32) -> RegistrarResult<RegisterOutcome> {
        let mut entry = self
            .extensions
            .get_mut(number)
            .ok_or_else(|| RegistrarError::UnknownExtension(number.to_string()))?;

        if requested_expires == 0 {
            entry.binding = None;
            info!(number, %source, "registration removed");
            return Ok(RegisterOutcome { contact_address: None, granted_expires: 0 });
        }

        let granted = requested_expires.min(self.max_expires);
        entry.binding = Some(Binding { address: source, expires_at: Instant::now() + Duration::from_secs(granted as u64) });
        debug!(number, %source, granted, "registration refreshed");
        Ok(RegisterOutcome { contact_address: Some(source), granted_expires: granted })
    }

    /// Reap bindings whose expiry has passed. Returns the numbers
    /// whose binding was removed.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for mut entry in self.extensions.iter_mut() {
            if let Some(binding) = entry.binding {
                if binding.is_expired(now) {
                    entry.binding = None;
                    expired.push(entry.number.clone());
                }
            }
        }
        expired
    }

    pub fn active_registration_count(&self) -> usize {
        let now = Instant::now();
        self.extensions.iter().filter(|e| e.is_registered(now)).count()
    }
}

/// Parse the `Expires` value for a REGISTER request: the `Expires`
/// header if present, else a `;expires=` parameter on the Contact
/// header, per §4.9.
pub fn parse_expires(expires_header: Option<&str>, contact_header: Option<&str>) -> Option<u32> {
    if let Some(h) = expires_header {
        if let Ok(v) = h.trim().parse() {
            return Some(v);
        }
    }
    contact_header?.split(';').find_map(|p| p.trim().strip_prefix("expires=")).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.5:5060".parse().unwrap()
    }

    #[test]
    fn register_refresh_caps_at_max_expires() {
        let registrar = Registrar::new(3600);
        registrar.provision(Extension::new("1001", "Alice", "ha1-placeholder")).unwrap();
        let outcome = registrar.register("1001", addr(), 7200).unwrap();
        assert_eq!(outcome.granted_expires, 3600);
    }

    #[test]
    fn zero_expires_removes_binding() {
        let registrar = Registrar::new(3600);
        registrar.provision(Extension::new("1001", "Alice", "ha1-placeholder")).unwrap();
        registrar.register("1001", addr(), 1800).unwrap();
        assert!(registrar.lookup("1001").unwrap().binding.is_some());
        registrar.register("1001", addr(), 0).unwrap();
        assert!(registrar.lookup("1001").unwrap().binding.is_none());
    }

    #[test]
    fn register_refresh_does_not_duplicate_binding() {
        let registrar = Registrar::new(3600);
        registrar.provision(Extension::new("1001", "Alice", "ha1")).unwrap();
        registrar.register("1001", addr(), 1800).unwrap();
        registrar.register("1001", addr(), 1800).unwrap();
        assert_eq!(registrar.active_registration_count(), 1);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let registrar = Registrar::new(3600);
        assert!(matches!(registrar.register("9999", addr(), 1800), Err(RegistrarError::UnknownExtension(_))));
    }

    #[test]
    fn parses_expires_header_over_contact_param() {
        assert_eq!(parse_expires(Some("60"), Some("<sip:a@b>;expires=120")), Some(60));
        assert_eq!(parse_expires(None, Some("<sip:a@b>;expires=120")), Some(120));
        assert_eq!(parse_expires(None, Some("<sip:a@b>")), None);
    }
}
