#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use channel_engine::{
    BackendTransport, ChannelEngine, DecryptOutcome, EngineEvent, EngineSettings, LastReadStore,
    LiveEventStream, TrustSource,
};
use chrono::DateTime;
use futures::StreamExt;
use shared::{
    domain::{Channel, ChannelId, EventId, Membership, PeerId, Timestamp},
    error::TransportError,
    protocol::{
        ChannelEvent, EncryptedEvent, LiveEvent, MembershipEvent, Party, TextEvent,
        TimelineDirection,
    },
};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub fn at(millis: i64) -> Timestamp {
    DateTime::from_timestamp_millis(millis).expect("timestamp")
}

pub fn peer(name: &str) -> PeerId {
    PeerId::new(name)
}

pub fn peers(names: &[&str]) -> HashSet<PeerId> {
    names.iter().map(|name| PeerId::new(*name)).collect()
}

pub fn channel(id: &str, peer: &str, local: Membership, remote: Membership) -> Channel {
    Channel {
        channel_id: ChannelId::new(id),
        peer_id: PeerId::new(peer),
        local_membership: local,
        remote_membership: remote,
        encrypted: true,
    }
}

pub fn text_event(channel: &str, id: &str, sender: Party, millis: i64) -> ChannelEvent {
    ChannelEvent::Text(TextEvent {
        event_id: EventId::new(id),
        channel_id: ChannelId::new(channel),
        sender,
        body: format!("text {id}"),
        timestamp: at(millis),
        was_encrypted: false,
    })
}

pub fn encrypted_event(channel: &str, id: &str, sender: Party, millis: i64) -> ChannelEvent {
    ChannelEvent::Encrypted(EncryptedEvent {
        event_id: EventId::new(id),
        channel_id: ChannelId::new(channel),
        sender,
        timestamp: at(millis),
        payload: serde_json::json!({ "body": format!("secret {id}") }),
    })
}

pub fn membership_event(
    channel: &str,
    sender: Party,
    subject: Party,
    membership: Membership,
) -> ChannelEvent {
    ChannelEvent::Membership(MembershipEvent {
        event_id: EventId::new(format!("$member-{channel}-{membership:?}")),
        channel_id: ChannelId::new(channel),
        sender,
        subject,
        membership,
        timestamp: at(1),
    })
}

pub fn forward(event: ChannelEvent) -> LiveEvent {
    LiveEvent {
        direction: TimelineDirection::Forward,
        event,
    }
}

pub fn backward(event: ChannelEvent) -> LiveEvent {
    LiveEvent {
        direction: TimelineDirection::Backward,
        event,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(PeerId),
    Join(ChannelId),
    Leave(ChannelId),
    Send(ChannelId, String),
    TrustAllDevices(PeerId),
    Paginate(ChannelId, u32),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Call::Create(_) | Call::Join(_) | Call::Leave(_))
    }
}

#[derive(Default)]
struct BackendState {
    channels: BTreeMap<ChannelId, Channel>,
    stored: HashMap<ChannelId, Vec<ChannelEvent>>,
    missing_profiles: HashSet<PeerId>,
    create_unencrypted: bool,
    send_failures: VecDeque<TransportError>,
    join_failures: HashMap<ChannelId, TransportError>,
    leave_fails: bool,
    paginate_failures: HashMap<ChannelId, TransportError>,
    undecryptable: HashSet<EventId>,
    calls: Vec<Call>,
    created: usize,
}

/// Recording backend whose channel list reflects the calls made against it.
pub struct FakeBackend {
    state: Mutex<BackendState>,
    live_tx: mpsc::UnboundedSender<LiveEvent>,
    live_rx: Mutex<Option<mpsc::UnboundedReceiver<LiveEvent>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(BackendState::default()),
            live_tx,
            live_rx: Mutex::new(Some(live_rx)),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BackendState) -> T) -> T {
        let mut state = self.state.lock().expect("backend state");
        f(&mut state)
    }

    pub fn add_channel(&self, channel: Channel) {
        self.with_state(|s| {
            s.channels.insert(channel.channel_id.clone(), channel);
        });
    }

    pub fn set_membership(&self, channel_id: &str, local: Membership, remote: Membership) {
        self.with_state(|s| {
            if let Some(channel) = s.channels.get_mut(&ChannelId::new(channel_id)) {
                channel.local_membership = local;
                channel.remote_membership = remote;
            }
        });
    }

    pub fn store_events(&self, channel_id: &str, newest_first: Vec<ChannelEvent>) {
        self.with_state(|s| {
            s.stored.insert(ChannelId::new(channel_id), newest_first);
        });
    }

    pub fn missing_profile(&self, peer_id: &PeerId) {
        self.with_state(|s| {
            s.missing_profiles.insert(peer_id.clone());
        });
    }

    pub fn create_unencrypted(&self) {
        self.with_state(|s| s.create_unencrypted = true);
    }

    pub fn fail_sends(&self, failures: impl IntoIterator<Item = TransportError>) {
        self.with_state(|s| s.send_failures.extend(failures));
    }

    pub fn fail_join(&self, channel_id: &str, err: TransportError) {
        self.with_state(|s| {
            s.join_failures.insert(ChannelId::new(channel_id), err);
        });
    }

    pub fn fail_leaves(&self) {
        self.with_state(|s| s.leave_fails = true);
    }

    pub fn fail_paginate(&self, channel_id: &str, err: TransportError) {
        self.with_state(|s| {
            s.paginate_failures.insert(ChannelId::new(channel_id), err);
        });
    }

    pub fn undecryptable(&self, event_id: &str) {
        self.with_state(|s| {
            s.undecryptable.insert(EventId::new(event_id));
        });
    }

    pub fn push_live(&self, event: LiveEvent) {
        self.live_tx.send(event).expect("live feed open");
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.with_state(|s| s.channels.values().cloned().collect())
    }

    pub fn channels_for(&self, peer_id: &PeerId) -> Vec<Channel> {
        self.channels()
            .into_iter()
            .filter(|channel| &channel.peer_id == peer_id)
            .collect()
    }
}

#[async_trait]
impl BackendTransport for FakeBackend {
    async fn list_direct_channels(&self, peer_id: &PeerId) -> Result<Vec<Channel>, TransportError> {
        Ok(self.channels_for(peer_id))
    }

    async fn list_all_direct_channels(&self) -> Result<Vec<Channel>, TransportError> {
        Ok(self.channels())
    }

    async fn peer_has_profile(&self, peer_id: &PeerId) -> Result<bool, TransportError> {
        Ok(self.with_state(|s| !s.missing_profiles.contains(peer_id)))
    }

    async fn create_encrypted_channel(&self, peer_id: &PeerId) -> Result<Channel, TransportError> {
        Ok(self.with_state(|s| {
            s.calls.push(Call::Create(peer_id.clone()));
            s.created += 1;
            let channel = Channel {
                channel_id: ChannelId::new(format!("!created-{}-{peer_id}", s.created)),
                peer_id: peer_id.clone(),
                local_membership: Membership::Joined,
                remote_membership: Membership::Invited,
                encrypted: !s.create_unencrypted,
            };
            s.channels
                .insert(channel.channel_id.clone(), channel.clone());
            channel
        }))
    }

    async fn join(&self, channel_id: &ChannelId) -> Result<(), TransportError> {
        self.with_state(|s| {
            s.calls.push(Call::Join(channel_id.clone()));
            if let Some(err) = s.join_failures.get(channel_id) {
                return Err(err.clone());
            }
            if let Some(channel) = s.channels.get_mut(channel_id) {
                channel.local_membership = Membership::Joined;
            }
            Ok(())
        })
    }

    async fn leave_and_forget(&self, channel_id: &ChannelId) -> Result<(), TransportError> {
        self.with_state(|s| {
            s.calls.push(Call::Leave(channel_id.clone()));
            if s.leave_fails {
                return Err(TransportError::other("leave rejected"));
            }
            s.channels.remove(channel_id);
            Ok(())
        })
    }

    async fn send_message(&self, channel_id: &ChannelId, text: &str) -> Result<(), TransportError> {
        self.with_state(|s| {
            s.calls.push(Call::Send(channel_id.clone(), text.to_string()));
            match s.send_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn live_events(&self) -> LiveEventStream {
        match self.live_rx.lock().expect("live feed").take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }

    async fn enumerate_stored_events(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ChannelEvent>, TransportError> {
        Ok(self.with_state(|s| s.stored.get(channel_id).cloned().unwrap_or_default()))
    }

    async fn decrypt(&self, events: Vec<EncryptedEvent>) -> DecryptOutcome {
        self.with_state(|s| {
            let mut outcome = DecryptOutcome::default();
            for event in events {
                if s.undecryptable.contains(&event.event_id) {
                    outcome
                        .failed
                        .push((event, TransportError::other("missing session key")));
                    continue;
                }
                let body = event.payload["body"].as_str().unwrap_or_default().to_string();
                outcome.decrypted.push(TextEvent {
                    event_id: event.event_id,
                    channel_id: event.channel_id,
                    sender: event.sender,
                    body,
                    timestamp: event.timestamp,
                    was_encrypted: true,
                });
            }
            outcome
        })
    }

    async fn trust_all_devices(&self, peer_id: &PeerId) -> Result<(), TransportError> {
        self.with_state(|s| s.calls.push(Call::TrustAllDevices(peer_id.clone())));
        Ok(())
    }

    async fn paginate_older(&self, channel_id: &ChannelId, count: u32) -> Result<(), TransportError> {
        self.with_state(|s| {
            s.calls.push(Call::Paginate(channel_id.clone(), count));
            match s.paginate_failures.get(channel_id) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }
}

/// Backend call a [`GatedBackend`] can hold open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePoint {
    /// After the full channel listing a reconciliation pass starts from.
    Snapshot,
    /// Before a message send reaches the backend.
    Send,
}

/// Wraps a [`FakeBackend`] and parks the first call at an armed [`GatePoint`] until
/// the test releases it.
pub struct GatedBackend {
    inner: Arc<FakeBackend>,
    armed: Mutex<Option<GatePoint>>,
    reached: Notify,
    release: Notify,
}

impl GatedBackend {
    pub fn new(inner: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: Mutex::new(None),
            reached: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn arm(&self, point: GatePoint) {
        *self.armed.lock().expect("gate") = Some(point);
    }

    pub async fn wait_until_parked(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self, point: GatePoint) {
        let hit = {
            let mut armed = self.armed.lock().expect("gate");
            if *armed == Some(point) {
                *armed = None;
                true
            } else {
                false
            }
        };
        if hit {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl BackendTransport for GatedBackend {
    async fn list_direct_channels(&self, peer_id: &PeerId) -> Result<Vec<Channel>, TransportError> {
        self.inner.list_direct_channels(peer_id).await
    }

    async fn list_all_direct_channels(&self) -> Result<Vec<Channel>, TransportError> {
        let channels = self.inner.list_all_direct_channels().await;
        self.pass(GatePoint::Snapshot).await;
        channels
    }

    async fn peer_has_profile(&self, peer_id: &PeerId) -> Result<bool, TransportError> {
        self.inner.peer_has_profile(peer_id).await
    }

    async fn create_encrypted_channel(&self, peer_id: &PeerId) -> Result<Channel, TransportError> {
        self.inner.create_encrypted_channel(peer_id).await
    }

    async fn join(&self, channel_id: &ChannelId) -> Result<(), TransportError> {
        self.inner.join(channel_id).await
    }

    async fn leave_and_forget(&self, channel_id: &ChannelId) -> Result<(), TransportError> {
        self.inner.leave_and_forget(channel_id).await
    }

    async fn send_message(&self, channel_id: &ChannelId, text: &str) -> Result<(), TransportError> {
        self.pass(GatePoint::Send).await;
        self.inner.send_message(channel_id, text).await
    }

    fn live_events(&self) -> LiveEventStream {
        self.inner.live_events()
    }

    async fn enumerate_stored_events(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ChannelEvent>, TransportError> {
        self.inner.enumerate_stored_events(channel_id).await
    }

    async fn decrypt(&self, events: Vec<EncryptedEvent>) -> DecryptOutcome {
        self.inner.decrypt(events).await
    }

    async fn trust_all_devices(&self, peer_id: &PeerId) -> Result<(), TransportError> {
        self.inner.trust_all_devices(peer_id).await
    }

    async fn paginate_older(&self, channel_id: &ChannelId, count: u32) -> Result<(), TransportError> {
        self.inner.paginate_older(channel_id, count).await
    }
}

/// Trust source with a separate cached answer for unforced checks.
#[derive(Default)]
pub struct FakeTrust {
    matches: Mutex<HashSet<PeerId>>,
    cached: Mutex<HashSet<PeerId>>,
    forced_checks: Mutex<Vec<PeerId>>,
    fail_with: Mutex<Option<String>>,
}

impl FakeTrust {
    pub fn new(matches: HashSet<PeerId>) -> Arc<Self> {
        Arc::new(Self {
            cached: Mutex::new(matches.clone()),
            matches: Mutex::new(matches),
            ..Self::default()
        })
    }

    pub fn set_matches(&self, matches: HashSet<PeerId>) {
        *self.cached.lock().expect("cached") = matches.clone();
        *self.matches.lock().expect("matches") = matches;
    }

    /// Changes only the authoritative answer; unforced checks keep the stale cache.
    pub fn set_authoritative(&self, matches: HashSet<PeerId>) {
        *self.matches.lock().expect("matches") = matches;
    }

    pub fn forced_checks(&self) -> Vec<PeerId> {
        self.forced_checks.lock().expect("forced checks").clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().expect("fail_with") = Some(message.to_string());
    }

    fn check_failure(&self) -> Result<()> {
        match self.fail_with.lock().expect("fail_with").as_ref() {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TrustSource for FakeTrust {
    async fn has_mutual_match(&self, peer_id: &PeerId, force_check: bool) -> Result<bool> {
        self.check_failure()?;
        if force_check {
            self.forced_checks
                .lock()
                .expect("forced checks")
                .push(peer_id.clone());
            return Ok(self.matches.lock().expect("matches").contains(peer_id));
        }
        Ok(self.cached.lock().expect("cached").contains(peer_id))
    }

    async fn current_matches(&self) -> Result<HashSet<PeerId>> {
        self.check_failure()?;
        Ok(self.matches.lock().expect("matches").clone())
    }
}

#[derive(Default)]
pub struct MemoryLastReads {
    entries: Mutex<HashMap<PeerId, Timestamp>>,
    removed: Mutex<Vec<PeerId>>,
    writes: Mutex<usize>,
}

impl MemoryLastReads {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seeded(entries: impl IntoIterator<Item = (PeerId, Timestamp)>) -> Arc<Self> {
        let store = Self::default();
        store.entries.lock().expect("entries").extend(entries);
        Arc::new(store)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Timestamp> {
        self.entries.lock().expect("entries").get(peer_id).copied()
    }

    pub fn removed(&self) -> Vec<PeerId> {
        self.removed.lock().expect("removed").clone()
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock().expect("writes")
    }
}

#[async_trait]
impl LastReadStore for MemoryLastReads {
    async fn load_last_reads(&self) -> Result<HashMap<PeerId, Timestamp>> {
        Ok(self.entries.lock().expect("entries").clone())
    }

    async fn set_last_read(&self, peer_id: &PeerId, read_at: Timestamp) -> Result<()> {
        *self.writes.lock().expect("writes") += 1;
        self.entries
            .lock()
            .expect("entries")
            .insert(peer_id.clone(), read_at);
        Ok(())
    }

    async fn remove(&self, peers: &HashSet<PeerId>) -> Result<()> {
        let mut entries = self.entries.lock().expect("entries");
        let mut removed = self.removed.lock().expect("removed");
        for peer_id in peers {
            entries.remove(peer_id);
            removed.push(peer_id.clone());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().expect("entries").clear();
        Ok(())
    }
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub trust: Arc<FakeTrust>,
    pub last_reads: Arc<MemoryLastReads>,
    pub engine: Arc<ChannelEngine>,
    pub events: broadcast::Receiver<EngineEvent>,
}

impl Harness {
    pub fn new(trusted: &[&str]) -> Self {
        Self::with_last_reads(trusted, MemoryLastReads::new())
    }

    pub fn with_last_reads(trusted: &[&str], last_reads: Arc<MemoryLastReads>) -> Self {
        let backend = FakeBackend::new();
        let trust = FakeTrust::new(peers(trusted));
        let engine = ChannelEngine::new_with_settings(
            backend.clone(),
            trust.clone(),
            last_reads.clone(),
            EngineSettings {
                catch_up_count: 20,
                ..EngineSettings::default()
            },
        );
        let events = engine.subscribe_events();
        Self {
            backend,
            trust,
            last_reads,
            engine,
            events,
        }
    }

    /// Everything published so far.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}
