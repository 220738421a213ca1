use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(PeerId);
id_newtype!(ChannelId);
id_newtype!(EventId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    #[serde(alias = "invite")]
    Invited,
    #[serde(alias = "join")]
    Joined,
    #[serde(alias = "leave")]
    Left,
    #[serde(alias = "ban")]
    Banned,
    /// No membership, or a state the engine does not act on such as a knock.
    #[default]
    #[serde(other)]
    None,
}

impl Membership {
    /// Invited or joined: the side still takes part in the channel.
    pub fn is_active(self) -> bool {
        matches!(self, Membership::Invited | Membership::Joined)
    }

    pub fn is_gone(self) -> bool {
        matches!(self, Membership::Left | Membership::Banned)
    }
}

/// A direct, two-party channel between the local user and `peer_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub peer_id: PeerId,
    pub local_membership: Membership,
    pub remote_membership: Membership,
    pub encrypted: bool,
}

impl Channel {
    pub fn is_ready(&self) -> bool {
        self.local_membership == Membership::Joined && self.remote_membership == Membership::Joined
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub peer_id: PeerId,
    pub channel_id: ChannelId,
    pub ready_to_chat: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedChannel {
    pub channel_id: ChannelId,
    pub peer_id: PeerId,
    pub event_cursor: Option<EventId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub event_id: EventId,
    pub direction: MessageDirection,
    pub text: String,
    pub timestamp: Timestamp,
    pub was_encrypted: bool,
}

/// Ordered view over a peer's recent history.
///
/// `sorted` is false when at least one event failed to decrypt; callers must not
/// rely on strict timestamp order in that case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpResult {
    pub peer_id: PeerId,
    pub messages: Vec<Message>,
    pub sorted: bool,
    pub unread_count: u32,
}
