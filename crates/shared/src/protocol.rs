use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelId, EventId, Membership, PeerId, Timestamp},
    error::{ApiError, TransportError},
};

const MEMBER_EVENT_TYPE: &str = "m.room.member";
const MESSAGE_EVENT_TYPE: &str = "m.room.message";
const ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";

/// Author or subject of an event, relative to the local user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "peer_id", rename_all = "snake_case")]
pub enum Party {
    Local,
    Peer(PeerId),
}

impl Party {
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Party::Local => None,
            Party::Peer(peer_id) => Some(peer_id),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Party::Local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineDirection {
    /// Newly delivered by the live sync.
    Forward,
    /// Replayed while back-filling history.
    Backward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub event_id: EventId,
    pub channel_id: ChannelId,
    pub sender: Party,
    /// Whose membership changed.
    pub subject: Party,
    pub membership: Membership,
    pub timestamp: Timestamp,
}

impl MembershipEvent {
    /// The remote peer this event concerns, whichever side it names.
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.subject.peer_id().or_else(|| self.sender.peer_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEvent {
    pub event_id: EventId,
    pub channel_id: ChannelId,
    pub sender: Party,
    pub body: String,
    pub timestamp: Timestamp,
    pub was_encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEvent {
    pub event_id: EventId,
    pub channel_id: ChannelId,
    pub sender: Party,
    pub timestamp: Timestamp,
    pub payload: serde_json::Value,
}

/// Closed set of backend events the engine understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelEvent {
    Membership(MembershipEvent),
    Text(TextEvent),
    Encrypted(EncryptedEvent),
    Other {
        event_id: EventId,
        channel_id: ChannelId,
        event_type: String,
        timestamp: Timestamp,
    },
}

impl ChannelEvent {
    pub fn event_id(&self) -> &EventId {
        match self {
            ChannelEvent::Membership(event) => &event.event_id,
            ChannelEvent::Text(event) => &event.event_id,
            ChannelEvent::Encrypted(event) => &event.event_id,
            ChannelEvent::Other { event_id, .. } => event_id,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        match self {
            ChannelEvent::Membership(event) => &event.channel_id,
            ChannelEvent::Text(event) => &event.channel_id,
            ChannelEvent::Encrypted(event) => &event.channel_id,
            ChannelEvent::Other { channel_id, .. } => channel_id,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            ChannelEvent::Membership(event) => event.timestamp,
            ChannelEvent::Text(event) => event.timestamp,
            ChannelEvent::Encrypted(event) => event.timestamp,
            ChannelEvent::Other { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub direction: TimelineDirection,
    pub event: ChannelEvent,
}

/// Event as handed over by the backend SDK, before classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChannelEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub origin_server_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MemberContent {
    membership: Membership,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    body: String,
}

impl RawChannelEvent {
    pub fn classify(self, local_user: &PeerId) -> Result<ChannelEvent, TransportError> {
        let party = |user: String| {
            if user == local_user.0 {
                Party::Local
            } else {
                Party::Peer(PeerId(user))
            }
        };
        let timestamp = timestamp_from_millis(self.origin_server_ts)?;
        let event_id = EventId(self.event_id);
        let channel_id = ChannelId(self.room_id);
        let sender = party(self.sender);

        let event = match self.event_type.as_str() {
            MEMBER_EVENT_TYPE => {
                let subject = self.state_key.ok_or_else(|| {
                    TransportError::Parse(format!("member event {event_id} has no state_key"))
                })?;
                let content: MemberContent = serde_json::from_value(self.content)?;
                ChannelEvent::Membership(MembershipEvent {
                    event_id,
                    channel_id,
                    sender,
                    subject: party(subject),
                    membership: content.membership,
                    timestamp,
                })
            }
            MESSAGE_EVENT_TYPE => {
                let content: MessageContent = serde_json::from_value(self.content)?;
                ChannelEvent::Text(TextEvent {
                    event_id,
                    channel_id,
                    sender,
                    body: content.body,
                    timestamp,
                    was_encrypted: false,
                })
            }
            ENCRYPTED_EVENT_TYPE => ChannelEvent::Encrypted(EncryptedEvent {
                event_id,
                channel_id,
                sender,
                timestamp,
                payload: self.content,
            }),
            _ => ChannelEvent::Other {
                event_id,
                channel_id,
                event_type: self.event_type.clone(),
                timestamp,
            },
        };
        Ok(event)
    }
}

pub fn timestamp_from_millis(millis: i64) -> Result<Timestamp, TransportError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| TransportError::Parse(format!("timestamp out of range: {millis}")))
}

pub fn parse_channel_event(raw: &str, local_user: &PeerId) -> Result<ChannelEvent, TransportError> {
    let raw: RawChannelEvent = serde_json::from_str(raw)?;
    raw.classify(local_user)
}

pub fn parse_api_error(raw: &str) -> TransportError {
    match serde_json::from_str::<ApiError>(raw) {
        Ok(api_error) => api_error.into(),
        Err(err) => TransportError::Parse(format!("invalid error body: {err}")),
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
