//! Digest authentication (RFC 2617, §4.7) and the registration-failure
//! blocklist.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::RngCore;

/// Default realm advertised in challenges; overridable via config.
pub const DEFAULT_REALM: &str = "pbx";

fn hex_md5(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    hex::encode(digest)
}

/// HA1 = MD5(username:realm:password), the value stored instead of a
/// plaintext password so challenges can be verified without ever
/// holding the password itself in memory longer than provisioning.
pub fn compute_ha1(username: &str, realm: &str, password: &str) -> String {
    hex_md5(&format!("{username}:{realm}:{password}"))
}

fn compute_ha2(method: &str, uri: &str) -> String {
    hex_md5(&format!("{method}:{uri}"))
}

/// The digest `response` a correctly-authenticating client would send.
pub fn compute_response(ha1: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha2 = compute_ha2(method, uri);
    hex_md5(&format!("{ha1}:{nonce}:{ha2}"))
}

/// Verify a client-supplied digest `response` against the stored HA1.
pub fn verify_response(ha1: &str, nonce: &str, method: &str, uri: &str, response: &str) -> bool {
    compute_response(ha1, nonce, method, uri) == response
}

/// A fresh nonce for a 401/407 challenge. Not tracked for single-use
/// replay protection here — the spec's auth model only requires a
/// server-generated nonce be present, not a nonce-count cache.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A parsed `Authorization`/`Proxy-Authorization` header's digest
/// parameters.
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl DigestCredentials {
    /// Parse `Digest key="value", key="value", ...` parameters.
    pub fn parse(header_value: &str) -> Option<Self> {
        let rest = header_value.strip_prefix("Digest")?.trim();
        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;

        for part in rest.split(',') {
            let part = part.trim();
            let (key, value) = part.split_once('=')?;
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "username" => username = Some(value.to_string()),
                "realm" => realm = Some(value.to_string()),
                "nonce" => nonce = Some(value.to_string()),
                "uri" => uri = Some(value.to_string()),
                "response" => response = Some(value.to_string()),
                _ => {}
            }
        }

        Some(DigestCredentials {
            username: username?,
            realm: realm?,
            nonce: nonce?,
            uri: uri?,
            response: response?,
        })
    }
}

/// Sliding-window failure counter keyed by source address, used to
/// block sources after repeated bad authentication attempts (§4.7/§7).
pub struct FailureTracker {
    failures: DashMap<SocketAddr, Mutex<Vec<Instant>>>,
    max_failures: usize,
    window: Duration,
}

impl FailureTracker {
    pub fn new(max_failures: usize, window: Duration) -> Self {
        FailureTracker { failures: DashMap::new(), max_failures, window }
    }

    /// Record a failed authentication attempt from `addr`. Returns
    /// `true` if this attempt pushed the source over the block
    /// threshold.
    pub fn record_failure(&self, addr: SocketAddr) -> bool {
        let entry = self.failures.entry(addr).or_insert_with(|| Mutex::new(Vec::new()));
        let mut attempts = entry.lock();
        let now = Instant::now();
        attempts.retain(|t| now.duration_since(*t) < self.window);
        attempts.push(now);
        attempts.len() >= self.max_failures
    }

    /// Whether `addr` is currently blocked.
    pub fn is_blocked(&self, addr: SocketAddr) -> bool {
        match self.failures.get(&addr) {
            Some(entry) => {
                let mut attempts = entry.lock();
                let now = Instant::now();
                attempts.retain(|t| now.duration_since(*t) < self.window);
                attempts.len() >= self.max_failures
            }
            None => false,
        }
    }

    /// Clear a source's failure history (e.g. after a successful auth).
    pub fn clear(&self, addr: SocketAddr) {
        self.failures.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_response_round_trips() {
        let ha1 = compute_ha1("alice", DEFAULT_REALM, "s3cret");
        let nonce = "abc123";
        let response = compute_response(&ha1, nonce, "REGISTER", "sip:pbx.example.com");
        assert!(verify_response(&ha1, nonce, "REGISTER", "sip:pbx.example.com", &response));
        assert!(!verify_response(&ha1, nonce, "REGISTER", "sip:pbx.example.com", "deadbeef"));
    }

    #[test]
    fn parses_digest_header() {
        let header = r#"Digest username="alice", realm="pbx", nonce="n123", uri="sip:pbx.example.com", response="abcd1234", algorithm=MD5"#;
        let creds = DigestCredentials::parse(header).unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.realm, "pbx");
        assert_eq!(creds.nonce, "n123");
        assert_eq!(creds.response, "abcd1234");
    }

    #[test]
    fn failure_tracker_blocks_after_threshold() {
        let tracker = FailureTracker::new(3, Duration::from_secs(60));
        let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        assert!(!tracker.record_failure(addr));
        assert!(!tracker.record_failure(addr));
        assert!(tracker.record_failure(addr));
        assert!(tracker.is_blocked(addr));
        tracker.clear(addr);
        assert!(!tracker.is_blocked(addr));
    }

    #[test]
    fn failure_tracker_window_expires_old_attempts() {
        let tracker = FailureTracker::new(2, Duration::from_millis(10));
        let addr: SocketAddr = "127.0.0.1:5061".parse().unwrap();
        assert!(tracker.record_failure(addr));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!tracker.is_blocked(addr));
    }
}
