use shared::domain::{ChannelId, Membership, PeerId};
use tracing::{info, warn};

use crate::{
    engine::ChannelEngine,
    error::{is_forbidden_error, is_unknown_device_error, EngineError},
};

impl ChannelEngine {
    /// Sends `text` on every joined channel with the peer.
    ///
    /// A forbidden or unknown-device failure triggers one recovery followed by exactly
    /// one retry. Any further failure is returned as is.
    pub async fn send(&self, peer_id: &PeerId, text: &str) -> Result<(), EngineError> {
        let _peer_guard = self.lock_peer(peer_id).await;

        let mut joined: Vec<ChannelId> = self
            .transport
            .list_direct_channels(peer_id)
            .await?
            .into_iter()
            .filter(|channel| channel.local_membership == Membership::Joined)
            .map(|channel| channel.channel_id)
            .collect();
        if joined.is_empty() {
            return Err(EngineError::NotJoined);
        }
        joined.sort();

        let mut recovery_available = true;
        for channel_id in joined {
            if let Err(err) = self
                .send_on_channel(peer_id, &channel_id, text, &mut recovery_available)
                .await
            {
                err.log("send");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn send_on_channel(
        &self,
        peer_id: &PeerId,
        channel_id: &ChannelId,
        text: &str,
        recovery_available: &mut bool,
    ) -> Result<(), EngineError> {
        let err = match self.transport.send_message(channel_id, text).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !*recovery_available {
            return Err(EngineError::Sdk(err));
        }

        if is_forbidden_error(&err) {
            *recovery_available = false;
            warn!(peer_id = %peer_id, channel_id = %channel_id, "send: forbidden, recovering");
            let retry_channel = self.recover_forbidden(peer_id, channel_id).await?;
            return self.retry_send(peer_id, &retry_channel, text).await;
        }

        if is_unknown_device_error(&err) {
            *recovery_available = false;
            warn!(peer_id = %peer_id, channel_id = %channel_id, "send: unknown device, trusting peer devices");
            self.transport.trust_all_devices(peer_id).await?;
            return self.retry_send(peer_id, channel_id, text).await;
        }

        Err(EngineError::Sdk(err))
    }

    /// Forgets the rejected channel and, while trust still holds, opens a new one.
    async fn recover_forbidden(
        &self,
        peer_id: &PeerId,
        channel_id: &ChannelId,
    ) -> Result<ChannelId, EngineError> {
        self.drop_channel(peer_id, channel_id).await;

        let trusted = self
            .trust
            .has_mutual_match(peer_id, true)
            .await
            .map_err(EngineError::trust)?;
        if !trusted {
            info!(peer_id = %peer_id, "send: peer no longer matched");
            return Err(EngineError::Unmatched);
        }

        let channel = self.create_channel_locked(peer_id).await?;
        Ok(channel.channel_id)
    }

    async fn retry_send(
        &self,
        peer_id: &PeerId,
        channel_id: &ChannelId,
        text: &str,
    ) -> Result<(), EngineError> {
        match self.transport.send_message(channel_id, text).await {
            Ok(()) => {
                info!(peer_id = %peer_id, channel_id = %channel_id, "send: retry succeeded");
                Ok(())
            }
            Err(err) => Err(EngineError::Sdk(err)),
        }
    }
}
