use shared::domain::{CatchUpResult, ChannelId, EventId, Message, PeerId};

/// Notifications published to the application on the engine's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Both sides are joined; the peer's canonical channel can carry messages.
    ChannelReady {
        peer_id: PeerId,
        channel_id: ChannelId,
    },
    MessageReceived {
        peer_id: PeerId,
        channel_id: ChannelId,
        message: Message,
    },
    DecryptionFault(DecryptionFault),
    CatchUpReady(CatchUpResult),
    /// The peer's channel went away. `channel_id` is `None` when the peer was revoked
    /// without a known canonical channel.
    ChannelRemoved {
        peer_id: PeerId,
        channel_id: Option<ChannelId>,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Abandon the channel and start a fresh encrypted one with the same peer.
    RecreateChannel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionFault {
    pub peer_id: PeerId,
    pub channel_id: ChannelId,
    pub event_id: EventId,
    pub reason: String,
    pub recovery: RecoveryAction,
}

impl DecryptionFault {
    pub fn new(
        peer_id: PeerId,
        channel_id: ChannelId,
        event_id: EventId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            peer_id,
            channel_id,
            event_id,
            reason: reason.into(),
            recovery: RecoveryAction::RecreateChannel,
        }
    }
}
