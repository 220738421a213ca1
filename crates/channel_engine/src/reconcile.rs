use std::collections::{BTreeMap, HashSet};

use shared::domain::{Channel, ChannelId, Membership, PeerId};
use tracing::{debug, info, warn};

use crate::{engine::ChannelEngine, error::EngineError, events::EngineEvent};

/// What to do with a peer's canonical channel after the listed forgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    Create,
    /// Keep an existing channel as canonical without touching the backend.
    Adopt { channel_id: ChannelId, ready: bool },
    /// Accept a pending invite, then make the channel canonical.
    Join {
        channel_id: ChannelId,
        remote_joined: bool,
    },
    /// Trust is gone: drop every channel and all cached state for the peer.
    Revoke,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPlan {
    pub forget: Vec<ChannelId>,
    pub action: PeerAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub peers: BTreeMap<PeerId, PeerPlan>,
}

impl ReconciliationPlan {
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerPlan> {
        self.peers.get(peer_id)
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<PeerId>,
    pub joined: Vec<PeerId>,
    pub adopted: Vec<PeerId>,
    pub revoked: Vec<PeerId>,
    pub forgotten: Vec<ChannelId>,
    pub failures: Vec<(PeerId, EngineError)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Decides, from snapshots only, how every affected peer converges.
///
/// `registered` lists peers the registry currently tracks, so a peer whose channels
/// already vanished from the backend is still revoked once trust goes away.
pub fn plan_reconciliation(
    trusted: &HashSet<PeerId>,
    channels: &[Channel],
    registered: &HashSet<PeerId>,
) -> ReconciliationPlan {
    let mut by_peer: BTreeMap<&PeerId, Vec<&Channel>> = BTreeMap::new();
    for channel in channels {
        by_peer.entry(&channel.peer_id).or_default().push(channel);
    }
    for peer_channels in by_peer.values_mut() {
        peer_channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
    }

    let mut plan = ReconciliationPlan::default();

    for (peer_id, peer_channels) in &by_peer {
        if !trusted.contains(*peer_id) {
            plan.peers.insert(
                (*peer_id).clone(),
                PeerPlan {
                    forget: peer_channels.iter().map(|c| c.channel_id.clone()).collect(),
                    action: PeerAction::Revoke,
                },
            );
        }
    }
    for peer_id in registered {
        if !trusted.contains(peer_id) && !by_peer.contains_key(peer_id) {
            plan.peers.insert(
                peer_id.clone(),
                PeerPlan {
                    forget: Vec::new(),
                    action: PeerAction::Revoke,
                },
            );
        }
    }

    for peer_id in trusted {
        let peer_channels = by_peer.get(peer_id).map(Vec::as_slice).unwrap_or_default();
        plan.peers
            .insert(peer_id.clone(), plan_trusted_peer(peer_channels));
    }

    plan
}

fn plan_trusted_peer(channels: &[&Channel]) -> PeerPlan {
    let (gone, surviving): (Vec<&Channel>, Vec<&Channel>) = channels
        .iter()
        .copied()
        .partition(|channel| channel.remote_membership.is_gone());
    let mut forget: Vec<ChannelId> = gone.iter().map(|c| c.channel_id.clone()).collect();

    let both_joined = surviving.iter().find(|c| c.is_ready());
    let local_invited = || {
        surviving
            .iter()
            .find(|c| c.local_membership == Membership::Invited)
    };
    let remote_invited = || {
        surviving.iter().find(|c| {
            c.local_membership == Membership::Joined && c.remote_membership == Membership::Invited
        })
    };

    let (canonical, action) = if let Some(channel) = both_joined {
        (
            Some(&channel.channel_id),
            PeerAction::Adopt {
                channel_id: channel.channel_id.clone(),
                ready: true,
            },
        )
    } else if let Some(channel) = local_invited() {
        (
            Some(&channel.channel_id),
            PeerAction::Join {
                channel_id: channel.channel_id.clone(),
                remote_joined: channel.remote_membership == Membership::Joined,
            },
        )
    } else if let Some(channel) = remote_invited() {
        (
            Some(&channel.channel_id),
            PeerAction::Adopt {
                channel_id: channel.channel_id.clone(),
                ready: false,
            },
        )
    } else {
        (None, PeerAction::Create)
    };

    forget.extend(
        surviving
            .iter()
            .filter(|c| Some(&c.channel_id) != canonical)
            .map(|c| c.channel_id.clone()),
    );
    forget.sort();

    PeerPlan { forget, action }
}

/// Rebuilds a peer's plan from its current channels, keeping the trust decision.
fn replan_peer(snapshot: &PeerPlan, current: &[Channel]) -> PeerPlan {
    let mut channels: Vec<&Channel> = current.iter().collect();
    channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
    if snapshot.action == PeerAction::Revoke {
        return PeerPlan {
            forget: channels.iter().map(|c| c.channel_id.clone()).collect(),
            action: PeerAction::Revoke,
        };
    }
    plan_trusted_peer(&channels)
}

impl ChannelEngine {
    /// Converges the registry onto the trust source's current match set.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let trusted = self
            .trust
            .current_matches()
            .await
            .map_err(EngineError::trust)?;
        self.reconcile_with(trusted).await
    }

    /// Runs a reconciliation pass against a match set pushed by the caller.
    pub async fn on_trust_changed(
        &self,
        matches: HashSet<PeerId>,
    ) -> Result<ReconcileReport, EngineError> {
        self.reconcile_with(matches).await
    }

    async fn reconcile_with(&self, trusted: HashSet<PeerId>) -> Result<ReconcileReport, EngineError> {
        let channels = self.transport.list_all_direct_channels().await?;
        let registered: HashSet<PeerId> = {
            let registry = self.registry.lock().await;
            registry.peers().cloned().collect()
        };

        let plan = plan_reconciliation(&trusted, &channels, &registered);
        info!(
            trusted = trusted.len(),
            channels = channels.len(),
            peers = plan.peers.len(),
            "reconcile: pass started"
        );

        let mut report = ReconcileReport::default();
        for (peer_id, peer_plan) in plan.peers {
            self.apply_peer_plan(&peer_id, peer_plan, &mut report).await;
        }

        info!(
            created = report.created.len(),
            joined = report.joined.len(),
            revoked = report.revoked.len(),
            forgotten = report.forgotten.len(),
            failures = report.failures.len(),
            "reconcile: pass finished"
        );
        Ok(report)
    }

    async fn apply_peer_plan(&self, peer_id: &PeerId, plan: PeerPlan, report: &mut ReconcileReport) {
        let _peer_guard = self.lock_peer(peer_id).await;

        // The pass snapshot may predate another operation on this peer.
        let plan = match self.transport.list_direct_channels(peer_id).await {
            Ok(current) => replan_peer(&plan, &current),
            Err(err) => {
                let err = EngineError::from(err);
                err.log("reconcile");
                report.failures.push((peer_id.clone(), err));
                return;
            }
        };

        let revoking = plan.action == PeerAction::Revoke;
        let mut removed_canonical = None;
        for channel_id in plan.forget {
            if self.forget_channel_best_effort(&channel_id).await.is_some() {
                removed_canonical = Some(channel_id.clone());
                if !revoking {
                    let _ = self.events.send(EngineEvent::ChannelRemoved {
                        peer_id: peer_id.clone(),
                        channel_id: Some(channel_id.clone()),
                    });
                }
            }
            report.forgotten.push(channel_id);
        }

        let outcome = match plan.action {
            PeerAction::Revoke => {
                self.revoke_peer_locked(peer_id, removed_canonical).await;
                report.revoked.push(peer_id.clone());
                Ok(())
            }
            PeerAction::Create => self.create_channel_locked(peer_id).await.map(|_| {
                report.created.push(peer_id.clone());
            }),
            PeerAction::Adopt { channel_id, ready } => {
                self.adopt_channel(peer_id, &channel_id, ready).await;
                report.adopted.push(peer_id.clone());
                Ok(())
            }
            PeerAction::Join {
                channel_id,
                remote_joined,
            } => match self.join_locked(&channel_id).await {
                Ok(()) => {
                    self.adopt_channel(peer_id, &channel_id, remote_joined).await;
                    report.joined.push(peer_id.clone());
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };

        match outcome {
            Ok(()) if !revoking => self.catch_up_after_reconcile(peer_id).await,
            Ok(()) => {}
            Err(err) => {
                err.log("reconcile");
                report.failures.push((peer_id.clone(), err));
            }
        }
    }

    /// Registers and observes an existing channel. Emits `ChannelReady` when the peer
    /// becomes ready for the first time.
    pub(crate) async fn adopt_channel(&self, peer_id: &PeerId, channel_id: &ChannelId, ready: bool) {
        let became_ready = {
            let mut registry = self.registry.lock().await;
            let was_ready = registry
                .entry(peer_id)
                .is_some_and(|entry| &entry.channel_id == channel_id && entry.ready_to_chat);
            registry.set_canonical(peer_id, channel_id, ready || was_ready);
            registry.observe(peer_id, channel_id);
            ready && !was_ready
        };
        debug!(peer_id = %peer_id, channel_id = %channel_id, ready, "reconcile: channel adopted");
        if became_ready {
            let _ = self.events.send(EngineEvent::ChannelReady {
                peer_id: peer_id.clone(),
                channel_id: channel_id.clone(),
            });
        }
    }

    /// Drops all local state for an untrusted peer. Channels must already be forgotten.
    pub(crate) async fn revoke_peer_locked(&self, peer_id: &PeerId, forgotten: Option<ChannelId>) {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.remove_peer(peer_id)
        };
        let peers = HashSet::from([peer_id.clone()]);
        if let Err(err) = self.last_reads.remove(&peers).await {
            EngineError::store(err).log("reconcile.revoke");
        }
        info!(peer_id = %peer_id, "reconcile: peer revoked");
        let _ = self.events.send(EngineEvent::ChannelRemoved {
            peer_id: peer_id.clone(),
            channel_id: removed.map(|entry| entry.channel_id).or(forgotten),
        });
    }

    async fn catch_up_after_reconcile(&self, peer_id: &PeerId) {
        if let Err(err) = self.catch_up_locked(peer_id, self.settings.catch_up_count).await {
            warn!(peer_id = %peer_id, error = %err, "reconcile: catch-up after reconcile failed");
        }
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
