//! Extension registry (§6 "Extension registry (external)"): looked up
//! by the router to resolve a dialplan destination and to check
//! credentials, provisioned out of band from whatever directory the
//! deployment uses.

use async_trait::async_trait;

/// A provisioned extension as seen by the router — distinct from
/// `pbx_registrar::Extension`, which additionally tracks the live
/// registration binding. This is the out-of-band provisioning record.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub number: String,
    pub display_name: String,
    pub has_voicemail: bool,
    pub mailbox_pin: String,
}

#[async_trait]
pub trait ExtensionRegistry: Send + Sync {
    async fn get(&self, number: &str) -> Option<DirectoryEntry>;
    async fn verify_credentials(&self, number: &str, password: &str) -> bool;
}
