//! Dialog table: created on first 1xx-with-tag or 2xx response,
//! destroyed on BYE or dialog timeout (§4.7).

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Dialog table key: (call-id, local-tag, remote-tag) per §4.7.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogKey {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>, remote_tag: impl Into<String>) -> Self {
        DialogKey { call_id: call_id.into(), local_tag: local_tag.into(), remote_tag: remote_tag.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub key: DialogKey,
    pub state: DialogState,
    pub remote_target: String,
    pub local_seq: u32,
    pub remote_seq: u32,
    created_at: Instant,
}

impl Dialog {
    pub fn new(key: DialogKey, remote_target: impl Into<String>) -> Self {
        Dialog {
            key,
            state: DialogState::Early,
            remote_target: remote_target.into(),
            local_seq: 0,
            remote_seq: 0,
            created_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Concurrent map of active dialogs, plus expiry sweeping for dialogs
/// that never reached `Confirmed` (an early dialog left in limbo when
/// no final response and no CANCEL ever arrived).
pub struct DialogTable {
    dialogs: DashMap<DialogKey, Dialog>,
    early_timeout: Duration,
}

impl DialogTable {
    pub fn new(early_timeout: Duration) -> Self {
        DialogTable { dialogs: DashMap::new(), early_timeout }
    }

    pub fn insert(&self, dialog: Dialog) {
        self.dialogs.insert(dialog.key.clone(), dialog);
    }

    pub fn get(&self, key: &DialogKey) -> Option<Dialog> {
        self.dialogs.get(key).map(|d| d.clone())
    }

    pub fn confirm(&self, key: &DialogKey) {
        if let Some(mut d) = self.dialogs.get_mut(key) {
            d.state = DialogState::Confirmed;
        }
    }

    pub fn remove(&self, key: &DialogKey) {
        self.dialogs.remove(key);
    }

    pub fn active_count(&self) -> usize {
        self.dialogs.len()
    }

    /// Reap early dialogs that outlived `early_timeout` without being
    /// confirmed or explicitly terminated.
    pub fn sweep_expired_early(&self) {
        let stale: Vec<DialogKey> = self
            .dialogs
            .iter()
            .filter(|d| d.state == DialogState::Early && d.age() >= self.early_timeout)
            .map(|d| d.key.clone())
            .collect();
        for key in stale {
            self.dialogs.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_transitions_state() {
        let table = DialogTable::new(Duration::from_secs(32));
        let key = DialogKey::new("call-1", "local-tag", "remote-tag");
        table.insert(Dialog::new(key.clone(), "sip:bob@1.2.3.4"));
        assert_eq!(table.get(&key).unwrap().state, DialogState::Early);
        table.confirm(&key);
        assert_eq!(table.get(&key).unwrap().state, DialogState::Confirmed);
    }

    #[test]
    fn remove_deletes_dialog() {
        let table = DialogTable::new(Duration::from_secs(32));
        let key = DialogKey::new("call-1", "a", "b");
        table.insert(Dialog::new(key.clone(), "sip:bob@1.2.3.4"));
        table.remove(&key);
        assert!(table.get(&key).is_none());
    }

    #[test]
    fn sweep_reaps_stale_early_dialogs_only() {
        let table = DialogTable::new(Duration::from_millis(1));
        let early_key = DialogKey::new("call-1", "a", "b");
        let confirmed_key = DialogKey::new("call-2", "c", "d");
        table.insert(Dialog::new(early_key.clone(), "sip:bob@1.2.3.4"));
        table.insert(Dialog::new(confirmed_key.clone(), "sip:carol@1.2.3.4"));
        table.confirm(&confirmed_key);
        std::thread::sleep(Duration::from_millis(5));
        table.sweep_expired_early();
        assert!(table.get(&early_key).is_none());
        assert!(table.get(&confirmed_key).is_some());
    }
}
