use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::UserId;
use tokio::sync::Mutex;

/// What the offline mirror holds, namespaced by the owning user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MirrorKey {
    Conversations(UserId),
    CurrentConversation(UserId),
}

impl MirrorKey {
    pub fn user_id(&self) -> &UserId {
        match self {
            Self::Conversations(user_id) | Self::CurrentConversation(user_id) => user_id,
        }
    }

    pub fn storage_key(&self) -> String {
        match self {
            Self::Conversations(user_id) => format!("conversations_{user_id}"),
            Self::CurrentConversation(user_id) => format!("current_chat_{user_id}"),
        }
    }
}

/// Non-authoritative on-device cache. Writes are best-effort; callers log and
/// carry on when they fail.
#[async_trait]
pub trait OfflineMirror: Send + Sync {
    async fn load(&self, key: &MirrorKey) -> Result<Option<String>>;
    async fn store(&self, key: &MirrorKey, value: &str) -> Result<()>;
    async fn remove(&self, key: &MirrorKey) -> Result<()>;
    /// Drops everything mirrored for `user_id`.
    async fn forget_user(&self, user_id: &UserId) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryMirror {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineMirror for MemoryMirror {
    async fn load(&self, key: &MirrorKey) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(&key.storage_key()).cloned())
    }

    async fn store(&self, key: &MirrorKey, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.storage_key(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &MirrorKey) -> Result<()> {
        self.entries.lock().await.remove(&key.storage_key());
        Ok(())
    }

    async fn forget_user(&self, user_id: &UserId) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for key in [
            MirrorKey::Conversations(user_id.clone()),
            MirrorKey::CurrentConversation(user_id.clone()),
        ] {
            entries.remove(&key.storage_key());
        }
        Ok(())
    }
}
