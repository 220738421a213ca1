use std::{collections::HashMap, sync::Arc};

use shared::domain::{ObservedChannel, PeerId, RegistryEntry, Timestamp};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::{
    config::EngineSettings, error::EngineError, events::EngineEvent, registry::ChannelRegistry,
    BackendTransport, LastReadStore, TrustSource,
};

/// Owns the channel registry and drives every channel lifecycle operation.
///
/// Shared as `Arc<ChannelEngine>`. Registry state sits behind one mutex that is never
/// held across a collaborator call; operations touching one peer additionally hold that
/// peer's lock for their whole duration.
pub struct ChannelEngine {
    pub(crate) transport: Arc<dyn BackendTransport>,
    pub(crate) trust: Arc<dyn TrustSource>,
    pub(crate) last_reads: Arc<dyn LastReadStore>,
    pub(crate) settings: EngineSettings,
    pub(crate) registry: Mutex<ChannelRegistry>,
    peer_locks: Mutex<HashMap<PeerId, Arc<Mutex<()>>>>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
}

impl ChannelEngine {
    pub fn new(
        transport: Arc<dyn BackendTransport>,
        trust: Arc<dyn TrustSource>,
        last_reads: Arc<dyn LastReadStore>,
    ) -> Arc<Self> {
        Self::new_with_settings(transport, trust, last_reads, EngineSettings::default())
    }

    pub fn new_with_settings(
        transport: Arc<dyn BackendTransport>,
        trust: Arc<dyn TrustSource>,
        last_reads: Arc<dyn LastReadStore>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Arc::new(Self {
            transport,
            trust,
            last_reads,
            settings,
            registry: Mutex::new(ChannelRegistry::new()),
            peer_locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Loads persisted watermarks, then runs the first reconciliation pass.
    pub async fn start(&self) -> Result<crate::ReconcileReport, EngineError> {
        let stored = self
            .last_reads
            .load_last_reads()
            .await
            .map_err(EngineError::store)?;
        info!(watermarks = stored.len(), "engine: last-read watermarks loaded");
        self.registry.lock().await.load_last_reads(stored);
        self.reconcile().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) async fn lock_peer(&self, peer_id: &PeerId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.peer_locks.lock().await;
            // Idle locks are only referenced by the map.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(peer_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn registry_entry(&self, peer_id: &PeerId) -> Option<RegistryEntry> {
        self.registry.lock().await.entry(peer_id).cloned()
    }

    pub async fn registry_entries(&self) -> Vec<RegistryEntry> {
        let registry = self.registry.lock().await;
        let mut entries: Vec<RegistryEntry> = registry.entries().cloned().collect();
        entries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        entries
    }

    pub async fn observed_channels(&self, peer_id: &PeerId) -> Vec<ObservedChannel> {
        let registry = self.registry.lock().await;
        registry
            .observed_for_peer(peer_id)
            .iter()
            .filter_map(|channel_id| registry.observed(channel_id).cloned())
            .collect()
    }

    pub async fn last_read(&self, peer_id: &PeerId) -> Option<Timestamp> {
        self.registry.lock().await.last_read(peer_id)
    }

    /// Advances the peer's last-read watermark. Older timestamps are ignored.
    pub async fn mark_read(&self, peer_id: &PeerId, read_at: Timestamp) -> Result<(), EngineError> {
        let advanced = self
            .registry
            .lock()
            .await
            .record_last_read(peer_id, read_at);
        if !advanced {
            debug!(peer_id = %peer_id, "engine: stale last-read ignored");
            return Ok(());
        }
        self.last_reads
            .set_last_read(peer_id, read_at)
            .await
            .map_err(EngineError::store)
    }

    /// Drops all in-memory state and every persisted watermark, e.g. on logout.
    ///
    /// Peer locks survive so operations already in flight stay serialized.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.registry.lock().await.clear();
        self.last_reads.clear().await.map_err(EngineError::store)?;
        info!("engine: state reset");
        Ok(())
    }
}
