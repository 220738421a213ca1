use shared::{
    domain::{CatchUpResult, Message, MessageDirection, PeerId, Timestamp},
    error::TransportError,
    protocol::{ChannelEvent, EncryptedEvent, Party, TextEvent},
};
use tracing::{debug, info, warn};

use crate::{
    engine::ChannelEngine,
    error::EngineError,
    events::{DecryptionFault, EngineEvent},
    DecryptOutcome,
};

/// Text shown in place of a message that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt]";

/// Stored events split by whether they still need decryption.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredBatch {
    pub plaintext: Vec<TextEvent>,
    pub encrypted: Vec<EncryptedEvent>,
}

/// Walks newest-first stored events until either group holds `count` events.
/// Membership and unknown events are skipped.
pub fn split_stored_events(
    events: impl IntoIterator<Item = ChannelEvent>,
    count: usize,
) -> StoredBatch {
    let mut batch = StoredBatch::default();
    if count == 0 {
        return batch;
    }
    for event in events {
        match event {
            ChannelEvent::Text(text) => batch.plaintext.push(text),
            ChannelEvent::Encrypted(encrypted) => batch.encrypted.push(encrypted),
            ChannelEvent::Membership(_) | ChannelEvent::Other { .. } => continue,
        }
        if batch.plaintext.len() >= count || batch.encrypted.len() >= count {
            break;
        }
    }
    batch
}

/// Builds the ordered catch-up view and the faults for events that failed to decrypt.
///
/// Without failures all messages are merged by timestamp. With failures the decrypted
/// group (including placeholders) comes first, then the plaintext group, each ordered
/// oldest first, and the result is flagged unsorted.
pub fn assemble_catch_up(
    peer_id: &PeerId,
    plaintext: Vec<TextEvent>,
    outcome: DecryptOutcome,
    last_read: Option<Timestamp>,
) -> (CatchUpResult, Vec<DecryptionFault>) {
    let sorted = outcome.failed.is_empty();

    let mut decrypted: Vec<Message> = outcome
        .decrypted
        .into_iter()
        .map(|event| Message {
            was_encrypted: true,
            ..message_from_text(event)
        })
        .collect();
    let mut faults = Vec::with_capacity(outcome.failed.len());
    for (event, err) in outcome.failed {
        faults.push(DecryptionFault::new(
            peer_id.clone(),
            event.channel_id.clone(),
            event.event_id.clone(),
            err.to_string(),
        ));
        decrypted.push(placeholder_message(event));
    }
    let mut plain: Vec<Message> = plaintext.into_iter().map(message_from_text).collect();

    let messages = if sorted {
        let mut merged = decrypted;
        merged.append(&mut plain);
        merged.sort_by_key(|message| message.timestamp);
        merged
    } else {
        decrypted.sort_by_key(|message| message.timestamp);
        plain.sort_by_key(|message| message.timestamp);
        decrypted.append(&mut plain);
        decrypted
    };

    let unread_count = messages
        .iter()
        .filter(|message| message.direction == MessageDirection::Received)
        .filter(|message| last_read.map_or(true, |read_at| message.timestamp > read_at))
        .count();

    (
        CatchUpResult {
            peer_id: peer_id.clone(),
            messages,
            sorted,
            unread_count: u32::try_from(unread_count).unwrap_or(u32::MAX),
        },
        faults,
    )
}

pub(crate) fn direction_of(sender: &Party) -> MessageDirection {
    if sender.is_local() {
        MessageDirection::Sent
    } else {
        MessageDirection::Received
    }
}

pub(crate) fn message_from_text(event: TextEvent) -> Message {
    Message {
        direction: direction_of(&event.sender),
        event_id: event.event_id,
        text: event.body,
        timestamp: event.timestamp,
        was_encrypted: event.was_encrypted,
    }
}

fn placeholder_message(event: EncryptedEvent) -> Message {
    Message {
        direction: direction_of(&event.sender),
        event_id: event.event_id,
        text: UNDECRYPTABLE_PLACEHOLDER.to_string(),
        timestamp: event.timestamp,
        was_encrypted: true,
    }
}

impl ChannelEngine {
    /// Merges up to `count` recent stored events of the peer's canonical channel into
    /// an ordered message list with unread accounting.
    pub async fn catch_up(&self, peer_id: &PeerId, count: usize) -> Result<CatchUpResult, EngineError> {
        let _peer_guard = self.lock_peer(peer_id).await;
        self.catch_up_locked(peer_id, count).await
    }

    pub(crate) async fn catch_up_locked(
        &self,
        peer_id: &PeerId,
        count: usize,
    ) -> Result<CatchUpResult, EngineError> {
        let (channel_id, last_read) = {
            let registry = self.registry.lock().await;
            let entry = registry.entry(peer_id).ok_or(EngineError::NotJoined)?;
            (entry.channel_id.clone(), registry.last_read(peer_id))
        };

        let stored = self.transport.enumerate_stored_events(&channel_id).await?;
        let batch = split_stored_events(stored, count);
        let outcome = if batch.encrypted.is_empty() {
            DecryptOutcome::default()
        } else {
            self.transport.decrypt(batch.encrypted).await
        };

        let (result, faults) = assemble_catch_up(peer_id, batch.plaintext, outcome, last_read);
        for fault in faults {
            warn!(
                peer_id = %peer_id,
                channel_id = %fault.channel_id,
                event_id = %fault.event_id,
                reason = %fault.reason,
                "catch_up: event failed to decrypt"
            );
            let _ = self.events.send(EngineEvent::DecryptionFault(fault));
        }
        info!(
            peer_id = %peer_id,
            channel_id = %channel_id,
            messages = result.messages.len(),
            unread = result.unread_count,
            sorted = result.sorted,
            "catch_up: history merged"
        );
        let _ = self.events.send(EngineEvent::CatchUpReady(result.clone()));
        Ok(result)
    }

    /// Requests older history for every observed channel of the peer. Channels with
    /// nothing older left are skipped; the first other failure is returned after all
    /// channels were tried.
    pub async fn paginate_older(&self, peer_id: &PeerId, count: u32) -> Result<(), EngineError> {
        let _peer_guard = self.lock_peer(peer_id).await;
        let channels = self.registry.lock().await.observed_for_peer(peer_id);

        let mut first_error = None;
        for channel_id in channels {
            match self.transport.paginate_older(&channel_id, count).await {
                Ok(()) => debug!(peer_id = %peer_id, channel_id = %channel_id, count, "catch_up: paginated"),
                Err(TransportError::CannotPaginate) => {
                    debug!(peer_id = %peer_id, channel_id = %channel_id, "catch_up: no older history")
                }
                Err(err) => {
                    warn!(peer_id = %peer_id, channel_id = %channel_id, error = %err, "catch_up: pagination failed");
                    first_error.get_or_insert(EngineError::from(err));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
