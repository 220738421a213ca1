use shared::{
    domain::{Channel, ChannelId, Membership, PeerId},
    error::TransportError,
};
use tracing::{debug, info, warn};

use crate::{engine::ChannelEngine, error::EngineError, events::EngineEvent};

impl ChannelEngine {
    /// Returns the peer's joined or invited direct channel, creating an encrypted one
    /// when none exists.
    pub async fn get_or_create_channel(&self, peer_id: &PeerId) -> Result<Channel, EngineError> {
        let _peer_guard = self.lock_peer(peer_id).await;
        let existing = self.transport.list_direct_channels(peer_id).await?;
        let mut usable: Vec<Channel> = existing
            .into_iter()
            .filter(|channel| channel.local_membership.is_active())
            .collect();
        usable.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        if let Some(channel) = usable.into_iter().next() {
            debug!(peer_id = %peer_id, channel_id = %channel.channel_id, "channels: reusing existing channel");
            return Ok(channel);
        }
        self.create_channel_locked(peer_id).await
    }

    /// Joins an invited channel. Already being joined counts as success.
    pub async fn join(&self, channel_id: &ChannelId, peer_id: &PeerId) -> Result<(), EngineError> {
        let _peer_guard = self.lock_peer(peer_id).await;
        self.join_locked(channel_id).await
    }

    /// Abandons `old_channel_id` in favour of a freshly created channel. Offered as the
    /// recovery for persistent decryption faults.
    pub async fn recreate_channel(
        &self,
        peer_id: &PeerId,
        old_channel_id: &ChannelId,
    ) -> Result<Channel, EngineError> {
        let _peer_guard = self.lock_peer(peer_id).await;
        let channel = self.create_channel_locked(peer_id).await?;
        if &channel.channel_id != old_channel_id {
            self.forget_channel_best_effort(old_channel_id).await;
        }
        info!(
            peer_id = %peer_id,
            old_channel_id = %old_channel_id,
            channel_id = %channel.channel_id,
            "channels: channel recreated"
        );
        Ok(channel)
    }

    pub(crate) async fn create_channel_locked(&self, peer_id: &PeerId) -> Result<Channel, EngineError> {
        if !self.transport.peer_has_profile(peer_id).await? {
            return Err(EngineError::NoProfile);
        }

        let channel = self.transport.create_encrypted_channel(peer_id).await?;
        if &channel.peer_id != peer_id {
            let err = EngineError::Fatal(format!(
                "channel {} was created for {} instead of {peer_id}",
                channel.channel_id, channel.peer_id
            ));
            self.forget_channel_best_effort(&channel.channel_id).await;
            return Err(err);
        }
        if !channel.encrypted {
            warn!(peer_id = %peer_id, channel_id = %channel.channel_id, "channels: backend returned unencrypted channel");
            self.forget_channel_best_effort(&channel.channel_id).await;
            return Err(EngineError::NoEncryption);
        }

        let ready = channel.is_ready();
        {
            let mut registry = self.registry.lock().await;
            registry.set_canonical(peer_id, &channel.channel_id, ready);
            registry.observe(peer_id, &channel.channel_id);
        }
        info!(peer_id = %peer_id, channel_id = %channel.channel_id, "channels: encrypted channel created");
        Ok(channel)
    }

    pub(crate) async fn join_locked(&self, channel_id: &ChannelId) -> Result<(), EngineError> {
        match self.transport.join(channel_id).await {
            Ok(()) => {
                info!(channel_id = %channel_id, "channels: joined");
                Ok(())
            }
            Err(TransportError::AlreadyJoined) => {
                debug!(channel_id = %channel_id, "channels: already joined");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Leaves and forgets a channel, ignoring backend failures. Returns the peer when
    /// the channel was that peer's canonical channel.
    pub(crate) async fn forget_channel_best_effort(&self, channel_id: &ChannelId) -> Option<PeerId> {
        if let Err(err) = self.transport.leave_and_forget(channel_id).await {
            warn!(channel_id = %channel_id, error = %err, "channels: forget failed, continuing");
        }
        let removed = self.registry.lock().await.forget_channel(channel_id);
        debug!(channel_id = %channel_id, canonical = removed.is_some(), "channels: channel forgotten");
        removed
    }

    /// Forgets a channel and tells the application when a canonical channel went away.
    pub(crate) async fn drop_channel(&self, peer_id: &PeerId, channel_id: &ChannelId) {
        if self.forget_channel_best_effort(channel_id).await.is_some() {
            let _ = self.events.send(EngineEvent::ChannelRemoved {
                peer_id: peer_id.clone(),
                channel_id: Some(channel_id.clone()),
            });
        }
    }

    /// Readiness of a channel according to the backend's current membership view.
    pub(crate) async fn remote_has_joined(&self, peer_id: &PeerId, channel_id: &ChannelId) -> bool {
        match self.transport.list_direct_channels(peer_id).await {
            Ok(channels) => channels.iter().any(|channel| {
                &channel.channel_id == channel_id && channel.remote_membership == Membership::Joined
            }),
            Err(err) => {
                warn!(peer_id = %peer_id, channel_id = %channel_id, error = %err, "channels: membership lookup failed");
                false
            }
        }
    }
}
