use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::UserId;
use storage::Storage;
use tracing::debug;

use crate::mirror::{MirrorKey, OfflineMirror};

/// Offline mirror persisted in SQLite. Entries live in one namespace per user
/// so a user's cache can be listed or dropped as a whole.
pub struct DurableOfflineMirror {
    store: Storage,
}

impl DurableOfflineMirror {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize offline mirror at '{database_url}'"))?;
        store
            .health_check()
            .await
            .context("offline mirror database is not usable")?;
        Ok(Arc::new(Self { store }))
    }

    pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
        format!(
            "sqlite://{}",
            base_dir.join("offline_mirror.sqlite3").display()
        )
    }
}

#[async_trait]
impl OfflineMirror for DurableOfflineMirror {
    async fn load(&self, key: &MirrorKey) -> Result<Option<String>> {
        self.store
            .get_entry(key.user_id().as_str(), &key.storage_key())
            .await
    }

    async fn store(&self, key: &MirrorKey, value: &str) -> Result<()> {
        self.store
            .put_entry(key.user_id().as_str(), &key.storage_key(), value)
            .await
    }

    async fn remove(&self, key: &MirrorKey) -> Result<()> {
        self.store
            .delete_entry(key.user_id().as_str(), &key.storage_key())
            .await?;
        Ok(())
    }

    async fn forget_user(&self, user_id: &UserId) -> Result<()> {
        let dropped = self.store.clear_namespace(user_id.as_str()).await?;
        debug!(%user_id, dropped, "offline mirror cleared");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/durable_mirror_tests.rs"]
mod tests;
