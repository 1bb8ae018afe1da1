// In-process transport
//
// Routes envelopes between engines running in the same process over
// tokio channels. Used by tests and local simulations; supports the
// faults the consensus protocol must tolerate: partitioned peers and
// duplicated delivery.

use super::{Gateway, GroupId, InboundMessage, NetworkError, NetworkResult};
use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Inbox depth per registered peer
pub const INBOX_CAPACITY: usize = 1024;

#[derive(Default)]
struct HubState {
    inboxes: HashMap<PeerId, mpsc::Sender<InboundMessage>>,
    groups: HashMap<GroupId, Vec<PeerId>>,
    isolated: HashSet<PeerId>,
    duplicate: bool,
}

impl HubState {
    fn reachable(&self, from: &PeerId, to: &PeerId) -> bool {
        !self.isolated.contains(from) && !self.isolated.contains(to)
    }

    fn copies(&self) -> usize {
        if self.duplicate {
            2
        } else {
            1
        }
    }
}

/// Shared switchboard all local gateways route through
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer to the hub as a member of `groups`
    pub fn register(
        &self,
        peer: PeerId,
        groups: &[GroupId],
    ) -> (LocalGateway, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut state = self.lock();
        state.inboxes.insert(peer, tx);
        for group in groups {
            let members = state.groups.entry(group.clone()).or_default();
            if !members.contains(&peer) {
                members.push(peer);
            }
        }
        drop(state);

        let gateway = LocalGateway {
            local: peer,
            hub: self.clone(),
        };
        (gateway, rx)
    }

    /// Drop all traffic to and from `peer` until healed
    pub fn isolate(&self, peer: PeerId) {
        self.lock().isolated.insert(peer);
    }

    pub fn heal(&self, peer: &PeerId) {
        self.lock().isolated.remove(peer);
    }

    /// Deliver every message twice
    pub fn set_duplicate(&self, duplicate: bool) {
        self.lock().duplicate = duplicate;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn deliver(targets: Vec<mpsc::Sender<InboundMessage>>, message: InboundMessage) {
        for inbox in targets {
            // Best effort delivery
            if inbox.send(message.clone()).await.is_err() {
                trace!(sender = %message.sender, "Dropping message for closed inbox");
            }
        }
    }
}

/// Gateway handle bound to one peer of a `LocalHub`
#[derive(Clone)]
pub struct LocalGateway {
    local: PeerId,
    hub: LocalHub,
}

impl LocalGateway {
    pub fn local_peer(&self) -> PeerId {
        self.local
    }
}

#[async_trait]
impl Gateway for LocalGateway {
    async fn broadcast(&self, group: &GroupId, bytes: Vec<u8>) -> NetworkResult<()> {
        let targets = {
            let state = self.hub.lock();
            let members = state
                .groups
                .get(group)
                .ok_or_else(|| NetworkError::UnknownGroup(group.clone()))?;
            let copies = state.copies();
            members
                .iter()
                .filter(|peer| **peer != self.local && state.reachable(&self.local, peer))
                .filter_map(|peer| state.inboxes.get(peer).cloned())
                .flat_map(|inbox| std::iter::repeat(inbox).take(copies))
                .collect::<Vec<_>>()
        };

        trace!(group = %group, fanout = targets.len(), "Broadcasting");
        LocalHub::deliver(
            targets,
            InboundMessage {
                sender: self.local,
                bytes,
            },
        )
        .await;
        Ok(())
    }

    async fn send_to(&self, peer: &PeerId, bytes: Vec<u8>) -> NetworkResult<()> {
        let targets = {
            let state = self.hub.lock();
            let inbox = state
                .inboxes
                .get(peer)
                .cloned()
                .ok_or(NetworkError::PeerNotFound(*peer))?;
            if state.reachable(&self.local, peer) {
                vec![inbox; state.copies()]
            } else {
                Vec::new()
            }
        };

        LocalHub::deliver(
            targets,
            InboundMessage {
                sender: self.local,
                bytes,
            },
        )
        .await;
        Ok(())
    }
}
