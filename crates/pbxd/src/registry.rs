//! A static `ExtensionRegistry` backed by the `[[extensions]]` table in
//! the config file — the out-of-band provisioning source §6 calls for,
//! without inventing a directory/LDAP integration this core doesn't own.

use std::collections::HashMap;

use async_trait::async_trait;
use pbx_call::external::{DirectoryEntry, ExtensionRegistry};

use crate::config::ExtensionEntry;

pub struct ConfigExtensionRegistry {
    entries: HashMap<String, ExtensionEntry>,
}

impl ConfigExtensionRegistry {
    pub fn new(entries: &[ExtensionEntry]) -> Self {
        ConfigExtensionRegistry { entries: entries.iter().map(|e| (e.number.clone(), e.clone())).collect() }
    }
}

#[async_trait]
impl ExtensionRegistry for ConfigExtensionRegistry {
    async fn get(&self, number: &str) -> Option<DirectoryEntry> {
        self.entries.get(number).map(|e| DirectoryEntry {
            number: e.number.clone(),
            display_name: e.display_name.clone(),
            has_voicemail: e.has_voicemail,
            mailbox_pin: e.mailbox_pin.clone(),
        })
    }

    async fn verify_credentials(&self, number: &str, password: &str) -> bool {
        self.entries.get(number).map(|e| e.password == password).unwrap_or(false)
    }
}
