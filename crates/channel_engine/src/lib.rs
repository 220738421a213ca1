//! Lifecycle engine keeping one encrypted direct channel per mutually matched peer.
//!
//! The engine sits between three collaborators it does not own:
//!
//! - [`BackendTransport`]: the federated chat backend (channels, membership, history,
//!   decryption).
//! - [`TrustSource`]: decides whether two users are still mutually matched.
//! - [`LastReadStore`]: durable last-read watermarks per peer.
//!
//! [`ChannelEngine`] reconciles the channel set against the match set, creates and
//! joins channels, sends with one-shot recovery, merges history for catch-up and reacts
//! to live membership events. Application-facing notifications are published as
//! [`EngineEvent`]s on a broadcast channel.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{Channel, ChannelId, PeerId, Timestamp},
    error::TransportError,
    protocol::{ChannelEvent, EncryptedEvent, LiveEvent, TextEvent},
};

mod channels;
pub mod config;
mod engine;
pub mod error;
pub mod events;
mod history;
mod membership;
mod persistence;
mod reconcile;
mod registry;
mod runtime;
mod send;

pub use config::{load_settings, prepare_database_url, EngineSettings};
pub use engine::ChannelEngine;
pub use error::EngineError;
pub use events::{DecryptionFault, EngineEvent, RecoveryAction};
pub use history::{assemble_catch_up, split_stored_events, StoredBatch, UNDECRYPTABLE_PLACEHOLDER};
pub use persistence::DurableLastReadStore;
pub use reconcile::{plan_reconciliation, PeerAction, PeerPlan, ReconcileReport, ReconciliationPlan};
pub use registry::ChannelRegistry;

pub type LiveEventStream = BoxStream<'static, LiveEvent>;

/// Result of a bulk decryption request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecryptOutcome {
    pub decrypted: Vec<TextEvent>,
    pub failed: Vec<(EncryptedEvent, TransportError)>,
}

#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn list_direct_channels(&self, peer_id: &PeerId) -> Result<Vec<Channel>, TransportError>;
    /// Every direct channel the local user knows about, tagged by peer.
    async fn list_all_direct_channels(&self) -> Result<Vec<Channel>, TransportError>;
    async fn peer_has_profile(&self, peer_id: &PeerId) -> Result<bool, TransportError>;
    async fn create_encrypted_channel(&self, peer_id: &PeerId) -> Result<Channel, TransportError>;
    async fn join(&self, channel_id: &ChannelId) -> Result<(), TransportError>;
    async fn leave_and_forget(&self, channel_id: &ChannelId) -> Result<(), TransportError>;
    async fn send_message(&self, channel_id: &ChannelId, text: &str)
        -> Result<(), TransportError>;
    fn live_events(&self) -> LiveEventStream;
    /// Locally stored events, newest first. Calling again restarts the enumeration.
    async fn enumerate_stored_events(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ChannelEvent>, TransportError>;
    async fn decrypt(&self, events: Vec<EncryptedEvent>) -> DecryptOutcome;
    async fn trust_all_devices(&self, peer_id: &PeerId) -> Result<(), TransportError>;
    async fn paginate_older(&self, channel_id: &ChannelId, count: u32)
        -> Result<(), TransportError>;
}

#[async_trait]
pub trait TrustSource: Send + Sync {
    /// `force_check` bypasses any cached answer.
    async fn has_mutual_match(&self, peer_id: &PeerId, force_check: bool) -> Result<bool>;
    async fn current_matches(&self) -> Result<HashSet<PeerId>>;
}

#[async_trait]
pub trait LastReadStore: Send + Sync {
    async fn load_last_reads(&self) -> Result<HashMap<PeerId, Timestamp>>;
    async fn set_last_read(&self, peer_id: &PeerId, read_at: Timestamp) -> Result<()>;
    async fn remove(&self, peers: &HashSet<PeerId>) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}
