use std::collections::HashMap;

use shared::domain::{ChannelId, EventId, ObservedChannel, PeerId, RegistryEntry, Timestamp};

/// In-memory bookkeeping of canonical channels, observed channels and cached
/// last-read watermarks.
///
/// Pure state: every mutation is synchronous so callers can apply it atomically while
/// holding the engine state lock.
#[derive(Debug, Default, Clone)]
pub struct ChannelRegistry {
    entries: HashMap<PeerId, RegistryEntry>,
    observed: HashMap<ChannelId, ObservedChannel>,
    last_reads: HashMap<PeerId, Timestamp>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, peer_id: &PeerId) -> Option<&RegistryEntry> {
        self.entries.get(peer_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.entries.keys()
    }

    /// Makes `channel_id` the peer's canonical channel. A previous canonical channel
    /// stops being observed.
    pub fn set_canonical(&mut self, peer_id: &PeerId, channel_id: &ChannelId, ready_to_chat: bool) {
        if let Some(previous) = self.entries.get(peer_id) {
            if &previous.channel_id != channel_id {
                self.observed.remove(&previous.channel_id);
            }
        }
        self.entries.insert(
            peer_id.clone(),
            RegistryEntry {
                peer_id: peer_id.clone(),
                channel_id: channel_id.clone(),
                ready_to_chat,
            },
        );
    }

    /// Flags the canonical entry owning `channel_id` as ready. Returns the peer when
    /// the flag changed.
    pub fn mark_ready(&mut self, channel_id: &ChannelId) -> Option<PeerId> {
        let entry = self
            .entries
            .values_mut()
            .find(|entry| &entry.channel_id == channel_id)?;
        if entry.ready_to_chat {
            return None;
        }
        entry.ready_to_chat = true;
        Some(entry.peer_id.clone())
    }

    /// Drops everything known about the peer. Returns the removed canonical entry.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<RegistryEntry> {
        self.observed.retain(|_, observed| &observed.peer_id != peer_id);
        self.last_reads.remove(peer_id);
        self.entries.remove(peer_id)
    }

    /// Stops tracking one channel. Returns the peer when it was that peer's canonical
    /// channel.
    pub fn forget_channel(&mut self, channel_id: &ChannelId) -> Option<PeerId> {
        self.observed.remove(channel_id);
        let peer_id = self
            .entries
            .values()
            .find(|entry| &entry.channel_id == channel_id)
            .map(|entry| entry.peer_id.clone())?;
        self.entries.remove(&peer_id);
        Some(peer_id)
    }

    /// Starts observing a channel. Returns false when it was already observed.
    pub fn observe(&mut self, peer_id: &PeerId, channel_id: &ChannelId) -> bool {
        if self.observed.contains_key(channel_id) {
            return false;
        }
        self.observed.insert(
            channel_id.clone(),
            ObservedChannel {
                channel_id: channel_id.clone(),
                peer_id: peer_id.clone(),
                event_cursor: None,
            },
        );
        true
    }

    pub fn observed(&self, channel_id: &ChannelId) -> Option<&ObservedChannel> {
        self.observed.get(channel_id)
    }

    pub fn observed_for_peer(&self, peer_id: &PeerId) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .observed
            .values()
            .filter(|observed| &observed.peer_id == peer_id)
            .map(|observed| observed.channel_id.clone())
            .collect();
        channels.sort();
        channels
    }

    pub fn advance_cursor(&mut self, channel_id: &ChannelId, event_id: &EventId) {
        if let Some(observed) = self.observed.get_mut(channel_id) {
            observed.event_cursor = Some(event_id.clone());
        }
    }

    /// Resolves the peer behind a channel, canonical or merely observed.
    pub fn peer_for_channel(&self, channel_id: &ChannelId) -> Option<PeerId> {
        if let Some(observed) = self.observed.get(channel_id) {
            return Some(observed.peer_id.clone());
        }
        self.entries
            .values()
            .find(|entry| &entry.channel_id == channel_id)
            .map(|entry| entry.peer_id.clone())
    }

    pub fn last_read(&self, peer_id: &PeerId) -> Option<Timestamp> {
        self.last_reads.get(peer_id).copied()
    }

    /// Returns true when the cached watermark advanced.
    pub fn record_last_read(&mut self, peer_id: &PeerId, read_at: Timestamp) -> bool {
        match self.last_reads.get(peer_id) {
            Some(current) if *current >= read_at => false,
            _ => {
                self.last_reads.insert(peer_id.clone(), read_at);
                true
            }
        }
    }

    pub fn load_last_reads(&mut self, last_reads: HashMap<PeerId, Timestamp>) {
        for (peer_id, read_at) in last_reads {
            self.record_last_read(&peer_id, read_at);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.observed.clear();
        self.last_reads.clear();
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
