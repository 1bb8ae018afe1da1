//! FBFT consensus core for a sharded blockchain committee
//!
//! A fixed committee agrees on one block hash per height in three steps:
//! the leader announces, members vote Prepare, then Commit, and a quorum
//! of Commit votes finalizes the block. Votes are BLS signatures, so each
//! phase closes with one aggregate signature and a signer bitmap. A round
//! that stalls is abandoned through a view change that rotates the leader.
//!
//! - [`roster`]: committee membership, quorum rule and leader selection
//! - [`message`]: wire codec and sender/vote authentication
//! - [`aggregator`]: exactly-once vote tallies and quorum certificates
//! - [`pacemaker`]: round timers, backoff and the liveness alarm
//! - [`fbft`]: the state machine and its tokio engine
//! - [`network`]: the transport contract and an in-process transport

pub mod aggregator;
pub mod config;
pub mod crypto;
pub mod fbft;
pub mod message;
pub mod network;
pub mod pacemaker;
pub mod roster;

pub use config::ConsensusConfig;
pub use crypto::{BLSPublicKey, BLSSecretKey, BLSSignature, Hash, KeyHandle, LocalKey};
pub use fbft::{
    Action, BlockSink, CommitCertificate, Consensus, ConsensusEngine, ConsensusStatus,
    DropReason, EngineHandle, Phase,
};
pub use network::{Gateway, GroupId, InboundMessage};
pub use roster::{CommitteePolicy, Member, Roster};
