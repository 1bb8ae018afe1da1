// Network gateway contract
//
// The transport is an external collaborator: it moves opaque, already
// authenticated byte envelopes between committee members with
// best-effort delivery (no ordering, no confirmation). The consensus
// engine only needs broadcast to a group, send to one peer, and an
// inbound queue.

use async_trait::async_trait;
use libp2p::gossipsub::IdentTopic;
use libp2p::PeerId;
use std::fmt;

pub mod local;

pub use local::{LocalGateway, LocalHub};

/// Network error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Failed to send message: {0}")]
    SendError(String),
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Named set of peers a message is broadcast to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Consensus group of a shard committee
    pub fn shard(shard_id: u32) -> Self {
        Self(format!("fbft/shard/{}/consensus/1.0.0", shard_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Gossipsub topic carrying this group's traffic
    pub fn topic(&self) -> IdentTopic {
        IdentTopic::new(self.0.clone())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bytes delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: PeerId,
    pub bytes: Vec<u8>,
}

/// Outbound half of the transport
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Deliver to every member of `group` except the local peer
    async fn broadcast(&self, group: &GroupId, bytes: Vec<u8>) -> NetworkResult<()>;

    /// Deliver to a single peer
    async fn send_to(&self, peer: &PeerId, bytes: Vec<u8>) -> NetworkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_group_names() {
        let group = GroupId::shard(3);
        assert_eq!(group.as_str(), "fbft/shard/3/consensus/1.0.0");
        assert_ne!(group, GroupId::shard(4));
        assert_eq!(group.topic().hash(), IdentTopic::new("fbft/shard/3/consensus/1.0.0").hash());
    }
}
