//! The `pbxd` configuration snapshot (§6 "Configuration (recognized
//! keys)"): loaded once from a TOML file, optionally overridden by a
//! handful of environment variables, and handed down as `Arc<PbxConfig>`.
//! No `config`/`figment` crate — plain `serde` + `toml`, matching the
//! rest of this workspace's dependency-light, serde-first style.

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

fn default_sip_port() -> u16 {
    5060
}
fn default_external_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_rtp_low() -> u16 {
    10_000
}
fn default_rtp_high() -> u16 {
    20_000
}
fn default_internal_pattern() -> String {
    r"^\d{4}$".to_string()
}
fn default_max_record_seconds() -> u64 {
    120
}
fn default_no_answer_seconds() -> u64 {
    25
}
fn default_dtmf_payload_type() -> u8 {
    101
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_ilbc_mode() -> u8 {
    30
}
fn default_fail_window_seconds() -> u64 {
    60
}
fn default_fail_threshold() -> usize {
    3
}
fn default_block_seconds() -> u64 {
    300
}
fn default_realm() -> String {
    pbx_dialog::auth::DEFAULT_REALM.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub sip_port: u16,
    pub external_ip: String,
    pub rtp_port_range: RtpPortRange,
    pub realm: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            sip_port: default_sip_port(),
            external_ip: default_external_ip(),
            rtp_port_range: RtpPortRange::default(),
            realm: default_realm(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtpPortRange {
    pub low: u16,
    pub high: u16,
}

impl Default for RtpPortRange {
    fn default() -> Self {
        RtpPortRange { low: default_rtp_low(), high: default_rtp_high() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialplanConfig {
    pub internal_pattern: String,
}

impl Default for DialplanConfig {
    fn default() -> Self {
        DialplanConfig { internal_pattern: default_internal_pattern() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoicemailConfig {
    pub prompt_dir: Option<String>,
    pub storage_dir: String,
    pub max_record_seconds: u64,
    pub no_answer_seconds: u64,
}

impl Default for VoicemailConfig {
    fn default() -> Self {
        VoicemailConfig {
            prompt_dir: None,
            storage_dir: "./voicemail".to_string(),
            max_record_seconds: default_max_record_seconds(),
            no_answer_seconds: default_no_answer_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DtmfConfig {
    pub payload_type: u8,
    pub debounce_ms: u64,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        DtmfConfig { payload_type: default_dtmf_payload_type(), debounce_ms: default_debounce_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IlbcConfig {
    pub mode: u8,
}

impl Default for IlbcConfig {
    fn default() -> Self {
        IlbcConfig { mode: default_ilbc_mode() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FeaturesConfig {
    pub voicemail: VoicemailConfig,
    pub dtmf: DtmfConfig,
    pub ilbc: IlbcConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub register_fail_window_seconds: u64,
    pub register_fail_threshold: usize,
    pub register_block_seconds: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            register_fail_window_seconds: default_fail_window_seconds(),
            register_fail_threshold: default_fail_threshold(),
            register_block_seconds: default_block_seconds(),
        }
    }
}

/// One statically-provisioned extension (§6: "Extensions are
/// provisioned out of band" — here, out of band means this file).
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionEntry {
    pub number: String,
    pub display_name: String,
    pub password: String,
    #[serde(default)]
    pub has_voicemail: bool,
    #[serde(default = "default_mailbox_pin")]
    pub mailbox_pin: String,
}

fn default_mailbox_pin() -> String {
    "0000".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PbxConfig {
    pub server: ServerConfig,
    pub dialplan: DialplanConfig,
    pub features: FeaturesConfig,
    pub security: SecurityConfig,
    pub extensions: Vec<ExtensionEntry>,
}

impl PbxConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            tracing::warn!(path = %path.display(), "no config file found, using defaults");
            PbxConfig::default()
        };
        Ok(config.with_env_overrides())
    }

    /// A handful of environment overrides for the keys most often
    /// changed per-deployment (container port mappings, NAT'd external
    /// IP) rather than a generic nested-key overlay.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("PBX_SIP_PORT") {
            if let Ok(port) = port.parse() {
                self.server.sip_port = port;
            }
        }
        if let Ok(ip) = std::env::var("PBX_EXTERNAL_IP") {
            self.server.external_ip = ip;
        }
        if let Ok(dir) = std::env::var("PBX_VOICEMAIL_STORAGE_DIR") {
            self.features.voicemail.storage_dir = dir;
        }
        self
    }

    pub fn bind_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(IpAddr::from([0, 0, 0, 0]), self.server.sip_port)
    }
}
