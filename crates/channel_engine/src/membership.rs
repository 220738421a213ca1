use shared::{
    domain::{ChannelId, Membership, PeerId},
    protocol::{ChannelEvent, LiveEvent, MembershipEvent, Party, TimelineDirection},
};
use tracing::{debug, info, warn};

use crate::{
    engine::ChannelEngine,
    error::EngineError,
    events::{DecryptionFault, EngineEvent},
    history::message_from_text,
};

impl ChannelEngine {
    /// Applies one event from the live feed. Events replayed backwards are ignored.
    pub async fn handle_live_event(&self, event: LiveEvent) -> Result<(), EngineError> {
        if event.direction == TimelineDirection::Backward {
            debug!(event_id = %event.event.event_id(), "membership: backward event ignored");
            return Ok(());
        }
        match event.event {
            ChannelEvent::Membership(membership) => self.handle_membership_event(membership).await,
            timeline => self.handle_timeline_event(timeline).await,
        }
    }

    async fn handle_membership_event(&self, event: MembershipEvent) -> Result<(), EngineError> {
        let peer_id = match event.peer_id() {
            Some(peer_id) => peer_id.clone(),
            None => match self.registry.lock().await.peer_for_channel(&event.channel_id) {
                Some(peer_id) => peer_id,
                None => {
                    debug!(channel_id = %event.channel_id, "membership: event for unknown channel ignored");
                    return Ok(());
                }
            },
        };
        let _peer_guard = self.lock_peer(&peer_id).await;

        match (&event.subject, event.membership) {
            (Party::Peer(_), Membership::Joined) => {
                let became_ready = self.registry.lock().await.mark_ready(&event.channel_id);
                if let Some(peer_id) = became_ready {
                    info!(peer_id = %peer_id, channel_id = %event.channel_id, "membership: peer joined, channel ready");
                    let _ = self.events.send(EngineEvent::ChannelReady {
                        peer_id,
                        channel_id: event.channel_id,
                    });
                }
                Ok(())
            }
            (Party::Local, Membership::Invited) => {
                self.handle_invite(&peer_id, &event.channel_id).await
            }
            (Party::Peer(_), Membership::Left | Membership::Banned) if !event.sender.is_local() => {
                self.handle_peer_left(&peer_id, &event.channel_id).await
            }
            (subject, membership) => {
                debug!(
                    peer_id = %peer_id,
                    channel_id = %event.channel_id,
                    local = subject.is_local(),
                    ?membership,
                    "membership: transition ignored"
                );
                Ok(())
            }
        }
    }

    async fn handle_invite(&self, peer_id: &PeerId, channel_id: &ChannelId) -> Result<(), EngineError> {
        let mut trusted = self
            .trust
            .has_mutual_match(peer_id, false)
            .await
            .map_err(EngineError::trust)?;
        if !trusted {
            trusted = self
                .trust
                .has_mutual_match(peer_id, true)
                .await
                .map_err(EngineError::trust)?;
        }
        if !trusted {
            info!(peer_id = %peer_id, channel_id = %channel_id, "membership: invite from unmatched peer, forgetting");
            self.drop_channel(peer_id, channel_id).await;
            return Ok(());
        }

        self.join_locked(channel_id).await?;
        let has_canonical = self.registry.lock().await.entry(peer_id).is_some();
        if has_canonical {
            debug!(peer_id = %peer_id, channel_id = %channel_id, "membership: joined duplicate, left for reconciliation");
            return Ok(());
        }

        let ready = self.remote_has_joined(peer_id, channel_id).await;
        self.adopt_channel(peer_id, channel_id, ready).await;
        if let Err(err) = self.catch_up_locked(peer_id, self.settings.catch_up_count).await {
            warn!(peer_id = %peer_id, error = %err, "membership: catch-up after join failed");
        }
        Ok(())
    }

    async fn handle_peer_left(&self, peer_id: &PeerId, channel_id: &ChannelId) -> Result<(), EngineError> {
        let was_canonical = self.forget_channel_best_effort(channel_id).await.is_some();
        let trusted = self
            .trust
            .has_mutual_match(peer_id, true)
            .await
            .map_err(EngineError::trust)?;

        if !trusted {
            let mut forgotten = was_canonical.then(|| channel_id.clone());
            match self.transport.list_direct_channels(peer_id).await {
                Ok(remaining) => {
                    for channel in remaining {
                        if self
                            .forget_channel_best_effort(&channel.channel_id)
                            .await
                            .is_some()
                        {
                            forgotten = Some(channel.channel_id);
                        }
                    }
                }
                Err(err) => {
                    warn!(peer_id = %peer_id, error = %err, "membership: listing remaining channels failed");
                }
            }
            self.revoke_peer_locked(peer_id, forgotten).await;
            return Ok(());
        }

        if was_canonical {
            let _ = self.events.send(EngineEvent::ChannelRemoved {
                peer_id: peer_id.clone(),
                channel_id: Some(channel_id.clone()),
            });
        }
        if self.registry.lock().await.entry(peer_id).is_none() {
            info!(peer_id = %peer_id, channel_id = %channel_id, "membership: peer left, recreating channel");
            self.create_channel_locked(peer_id).await?;
        }
        Ok(())
    }

    async fn handle_timeline_event(&self, event: ChannelEvent) -> Result<(), EngineError> {
        let channel_id = event.channel_id().clone();
        let event_id = event.event_id().clone();
        let Some(peer_id) = self
            .registry
            .lock()
            .await
            .observed(&channel_id)
            .map(|observed| observed.peer_id.clone())
        else {
            debug!(channel_id = %channel_id, "membership: event for unobserved channel ignored");
            return Ok(());
        };
        let _peer_guard = self.lock_peer(&peer_id).await;

        match event {
            ChannelEvent::Text(text) => {
                let _ = self.events.send(EngineEvent::MessageReceived {
                    peer_id: peer_id.clone(),
                    channel_id: channel_id.clone(),
                    message: message_from_text(text),
                });
            }
            ChannelEvent::Encrypted(encrypted) => {
                let outcome = self.transport.decrypt(vec![encrypted]).await;
                for text in outcome.decrypted {
                    let mut message = message_from_text(text);
                    message.was_encrypted = true;
                    let _ = self.events.send(EngineEvent::MessageReceived {
                        peer_id: peer_id.clone(),
                        channel_id: channel_id.clone(),
                        message,
                    });
                }
                for (failed, err) in outcome.failed {
                    warn!(
                        peer_id = %peer_id,
                        channel_id = %channel_id,
                        event_id = %failed.event_id,
                        error = %err,
                        "membership: live event failed to decrypt"
                    );
                    let _ = self.events.send(EngineEvent::DecryptionFault(DecryptionFault::new(
                        peer_id.clone(),
                        channel_id.clone(),
                        failed.event_id,
                        err.to_string(),
                    )));
                }
            }
            ChannelEvent::Membership(_) | ChannelEvent::Other { .. } => {}
        }

        self.registry
            .lock()
            .await
            .advance_cursor(&channel_id, &event_id);
        Ok(())
    }
}
