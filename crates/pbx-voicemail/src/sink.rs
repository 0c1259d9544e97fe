//! The voicemail persistence boundary (§6 "Voicemail sink"): an
//! external collaborator, opaque to the core (files+index, SQL,
//! object store are all valid backends).

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{VoicemailError, VoicemailResult};

/// A mailbox entry (§3 "Voicemail Mailbox").
#[derive(Debug, Clone)]
pub struct MailboxMessage {
    pub id: String,
    pub caller_id: String,
    pub wav_path: String,
    pub duration_seconds: u32,
    pub listened: bool,
    pub received_at: DateTime<Utc>,
}

/// Implemented by whatever backs mailbox persistence. The core only
/// ever appends messages and marks them listened/deleted; it never
/// concerns itself with the storage strategy.
#[async_trait]
pub trait VoicemailSink: Send + Sync {
    async fn save_message(
        &self,
        extension: &str,
        caller_id: &str,
        wav_bytes: Vec<u8>,
        duration_seconds: u32,
    ) -> VoicemailResult<String>;

    async fn get_messages(&self, extension: &str, unread_only: bool) -> VoicemailResult<Vec<MailboxMessage>>;

    async fn mark_listened(&self, extension: &str, message_id: &str) -> VoicemailResult<()>;

    /// Reverse `mark_listened` (Options menu's "mark-unread").
    async fn mark_unread(&self, extension: &str, message_id: &str) -> VoicemailResult<()>;

    async fn delete_message(&self, extension: &str, message_id: &str) -> VoicemailResult<()>;

    /// Commit a freshly re-recorded outgoing greeting (ReviewingGreeting
    /// state's `2`).
    async fn save_greeting(&self, extension: &str, wav_bytes: Vec<u8>) -> VoicemailResult<()>;

    /// The extension's current greeting, if one has been recorded, for
    /// the no-answer divert flow to play to the caller.
    async fn get_greeting(&self, extension: &str) -> VoicemailResult<Option<Vec<u8>>>;
}

/// In-memory `VoicemailSink` used by tests and the voicemail IVR's own
/// unit tests; not wired into `pbxd` by default.
#[derive(Default)]
pub struct InMemorySink {
    messages: tokio::sync::Mutex<std::collections::HashMap<String, Vec<MailboxMessage>>>,
    greetings: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl VoicemailSink for InMemorySink {
    async fn save_message(&self, extension: &str, caller_id: &str, wav_bytes: Vec<u8>, duration_seconds: u32) -> VoicemailResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut messages = self.messages.lock().await;
        messages.entry(extension.to_string()).or_default().push(MailboxMessage {
            id: id.clone(),
            caller_id: caller_id.to_string(),
            wav_path: format!("mem://{extension}/{id}.wav"),
            duration_seconds,
            listened: false,
            received_at: Utc::now(),
        });
        let _ = wav_bytes;
        Ok(id)
    }

    async fn get_messages(&self, extension: &str, unread_only: bool) -> VoicemailResult<Vec<MailboxMessage>> {
        let messages = self.messages.lock().await;
        Ok(messages
            .get(extension)
            .map(|list| list.iter().filter(|m| !unread_only || !m.listened).cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_listened(&self, extension: &str, message_id: &str) -> VoicemailResult<()> {
        let mut messages = self.messages.lock().await;
        if let Some(list) = messages.get_mut(extension) {
            if let Some(m) = list.iter_mut().find(|m| m.id == message_id) {
                m.listened = true;
            }
        }
        Ok(())
    }

    async fn mark_unread(&self, extension: &str, message_id: &str) -> VoicemailResult<()> {
        let mut messages = self.messages.lock().await;
        if let Some(list) = messages.get_mut(extension) {
            if let Some(m) = list.iter_mut().find(|m| m.id == message_id) {
                m.listened = false;
            }
        }
        Ok(())
    }

    async fn delete_message(&self, extension: &str, message_id: &str) -> VoicemailResult<()> {
        let mut messages = self.messages.lock().await;
        if let Some(list) = messages.get_mut(extension) {
            list.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn save_greeting(&self, extension: &str, wav_bytes: Vec<u8>) -> VoicemailResult<()> {
        self.greetings.lock().await.insert(extension.to_string(), wav_bytes);
        Ok(())
    }

    async fn get_greeting(&self, extension: &str) -> VoicemailResult<Option<Vec<u8>>> {
        Ok(self.greetings.lock().await.get(extension).cloned())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredMessage {
    id: String,
    caller_id: String,
    file_name: String,
    duration_seconds: u32,
    listened: bool,
    received_at: DateTime<Utc>,
}

impl StoredMessage {
    fn into_mailbox(self, base_dir: &std::path::Path, extension: &str) -> MailboxMessage {
        MailboxMessage {
            id: self.id,
            caller_id: self.caller_id,
            wav_path: base_dir.join(extension).join(&self.file_name).display().to_string(),
            duration_seconds: self.duration_seconds,
            listened: self.listened,
            received_at: self.received_at,
        }
    }
}

/// A `VoicemailSink` backed by one directory per mailbox under
/// `base_dir`, each holding the recorded `.wav` files plus an
/// `index.json` of message metadata and a `greeting.wav`.
pub struct FilesystemSink {
    base_dir: PathBuf,
}

impl FilesystemSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FilesystemSink { base_dir: base_dir.into() }
    }

    fn mailbox_dir(&self, extension: &str) -> PathBuf {
        self.base_dir.join(extension)
    }

    fn index_path(&self, extension: &str) -> PathBuf {
        self.mailbox_dir(extension).join("index.json")
    }

    fn greeting_path(&self, extension: &str) -> PathBuf {
        self.mailbox_dir(extension).join("greeting.wav")
    }

    async fn ensure_mailbox_dir(&self, extension: &str) -> VoicemailResult<PathBuf> {
        let dir = self.mailbox_dir(extension);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| VoicemailError::Sink(e.to_string()))?;
        Ok(dir)
    }

    async fn read_index(&self, extension: &str) -> VoicemailResult<Vec<StoredMessage>> {
        let path = self.index_path(extension);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| VoicemailError::Sink(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(VoicemailError::Sink(e.to_string())),
        }
    }

    async fn write_index(&self, extension: &str, messages: &[StoredMessage]) -> VoicemailResult<()> {
        let bytes = serde_json::to_vec_pretty(messages).map_err(|e| VoicemailError::Sink(e.to_string()))?;
        tokio::fs::write(self.index_path(extension), bytes).await.map_err(|e| VoicemailError::Sink(e.to_string()))
    }
}

#[async_trait]
impl VoicemailSink for FilesystemSink {
    async fn save_message(&self, extension: &str, caller_id: &str, wav_bytes: Vec<u8>, duration_seconds: u32) -> VoicemailResult<String> {
        let dir = self.ensure_mailbox_dir(extension).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let file_name = format!("{id}.wav");
        tokio::fs::write(dir.join(&file_name), &wav_bytes).await.map_err(|e| VoicemailError::Sink(e.to_string()))?;

        let mut messages = self.read_index(extension).await?;
        messages.push(StoredMessage {
            id: id.clone(),
            caller_id: caller_id.to_string(),
            file_name,
            duration_seconds,
            listened: false,
            received_at: Utc::now(),
        });
        self.write_index(extension, &messages).await?;
        Ok(id)
    }

    async fn get_messages(&self, extension: &str, unread_only: bool) -> VoicemailResult<Vec<MailboxMessage>> {
        let messages = self.read_index(extension).await?;
        Ok(messages
            .into_iter()
            .filter(|m| !unread_only || !m.listened)
            .map(|m| m.into_mailbox(&self.base_dir, extension))
            .collect())
    }

    async fn mark_listened(&self, extension: &str, message_id: &str) -> VoicemailResult<()> {
        let mut messages = self.read_index(extension).await?;
        if let Some(m) = messages.iter_mut().find(|m| m.id == message_id) {
            m.listened = true;
        } else {
            warn!(extension, message_id, "mark_listened: no such message");
        }
        self.write_index(extension, &messages).await
    }

    async fn mark_unread(&self, extension: &str, message_id: &str) -> VoicemailResult<()> {
        let mut messages = self.read_index(extension).await?;
        if let Some(m) = messages.iter_mut().find(|m| m.id == message_id) {
            m.listened = false;
        } else {
            warn!(extension, message_id, "mark_unread: no such message");
        }
        self.write_index(extension, &messages).await
    }

    async fn delete_message(&self, extension: &str, message_id: &str) -> VoicemailResult<()> {
        let mut messages = self.read_index(extension).await?;
        if let Some(pos) = messages.iter().position(|m| m.id == message_id) {
            let removed = messages.remove(pos);
            let path = self.mailbox_dir(extension).join(&removed.file_name);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(extension, message_id, error = %e, "failed to remove voicemail file");
            }
        }
        self.write_index(extension, &messages).await
    }

    async fn save_greeting(&self, extension: &str, wav_bytes: Vec<u8>) -> VoicemailResult<()> {
        self.ensure_mailbox_dir(extension).await?;
        tokio::fs::write(self.greeting_path(extension), wav_bytes).await.map_err(|e| VoicemailError::Sink(e.to_string()))
    }

    async fn get_greeting(&self, extension: &str) -> VoicemailResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.greeting_path(extension)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VoicemailError::Sink(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_sink_round_trips_a_message() {
        let sink = InMemorySink::default();
        let id = sink.save_message("1002", "1001", vec![1, 2, 3], 5).await.unwrap();
        let messages = sink.get_messages("1002", true).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        sink.mark_listened("1002", &id).await.unwrap();
        assert!(sink.get_messages("1002", true).await.unwrap().is_empty());
        assert_eq!(sink.get_messages("1002", false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn in_memory_sink_stores_and_returns_greeting() {
        let sink = InMemorySink::default();
        assert!(sink.get_greeting("1002").await.unwrap().is_none());
        sink.save_greeting("1002", vec![9, 9, 9]).await.unwrap();
        assert_eq!(sink.get_greeting("1002").await.unwrap(), Some(vec![9, 9, 9]));
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pbx-voicemail-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn filesystem_sink_round_trips_a_message_on_disk() {
        let dir = scratch_dir();
        let sink = FilesystemSink::new(&dir);
        let id = sink.save_message("1002", "1001", vec![1, 2, 3], 5).await.unwrap();

        let unread = sink.get_messages("1002", true).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, id);
        assert!(tokio::fs::metadata(&unread[0].wav_path).await.is_ok());

        sink.mark_listened("1002", &id).await.unwrap();
        assert!(sink.get_messages("1002", true).await.unwrap().is_empty());
        assert_eq!(sink.get_messages("1002", false).await.unwrap().len(), 1);

        sink.delete_message("1002", &id).await.unwrap();
        assert!(sink.get_messages("1002", false).await.unwrap().is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn filesystem_sink_persists_greeting_across_instances() {
        let dir = scratch_dir();
        {
            let sink = FilesystemSink::new(&dir);
            assert!(sink.get_greeting("1003").await.unwrap().is_none());
            sink.save_greeting("1003", vec![4, 5, 6]).await.unwrap();
        }
        let reopened = FilesystemSink::new(&dir);
        assert_eq!(reopened.get_greeting("1003").await.unwrap(), Some(vec![4, 5, 6]));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
