use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{PeerId, Timestamp};
use storage::Storage;
use tracing::debug;

use crate::LastReadStore;

/// Last-read watermarks kept in the SQLite store.
pub struct DurableLastReadStore {
    store: Storage,
}

impl DurableLastReadStore {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize last-read storage at '{database_url}'"))?;
        Ok(Arc::new(Self { store }))
    }

    pub fn from_storage(store: Storage) -> Arc<Self> {
        Arc::new(Self { store })
    }

    pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
        format!("sqlite://{}", base_dir.join("engine.db").display())
    }
}

#[async_trait]
impl LastReadStore for DurableLastReadStore {
    async fn load_last_reads(&self) -> Result<HashMap<PeerId, Timestamp>> {
        self.store.load_last_reads().await
    }

    async fn set_last_read(&self, peer_id: &PeerId, read_at: Timestamp) -> Result<()> {
        self.store.upsert_last_read(peer_id, read_at).await
    }

    async fn remove(&self, peers: &HashSet<PeerId>) -> Result<()> {
        let removed = self.store.delete_last_reads(peers).await?;
        debug!(requested = peers.len(), removed, "persistence: last-reads removed");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let removed = self.store.clear_last_reads().await?;
        debug!(removed, "persistence: last-reads cleared");
        Ok(())
    }
}
