/// FBFT round data structures
///
/// Phases, proposals, the actions the state machine asks the engine to
/// perform, and the reasons an inbound message is dropped.

use crate::aggregator::AggregationError;
use crate::crypto::{BLSSignature, Hash, SigningError};
use crate::message::{AuthError, CodecError, QuorumCertificate, SignerBitmap, VoteKind};
use crate::network::GroupId;
use crate::pacemaker::TimerToken;
use crate::roster::Roster;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Progress of the current round
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting for the leader's Announce
    Idle,
    /// Proposal adopted, Prepare vote cast
    Announced,
    /// Prepare quorum seen, Commit vote cast
    Prepared,
    /// Commit quorum seen; terminal for the round
    Committed,
    /// Timer expired; waiting for a new-view quorum
    ViewChanging,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "Idle",
            Phase::Announced => "Announced",
            Phase::Prepared => "Prepared",
            Phase::Committed => "Committed",
            Phase::ViewChanging => "ViewChanging",
        };
        f.write_str(name)
    }
}

/// Block a leader put up for the current height
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProposal {
    pub block_hash: Hash,
    pub height: u64,
    /// Committee index of the proposing leader
    pub leader: u32,
}

/// Per-height consensus state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundState {
    pub height: u64,
    pub view: u64,
    pub phase: Phase,
    /// Set once by the first valid Announce of this view
    pub proposal: Option<BlockProposal>,
    /// Local Commit vote already cast for the proposal
    pub commit_sent: bool,
}

impl RoundState {
    pub fn new(height: u64, view: u64) -> Self {
        Self {
            height,
            view,
            phase: Phase::Idle,
            proposal: None,
            commit_sent: false,
        }
    }
}

/// Finality proof handed to the block-application collaborator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitCertificate {
    pub height: u64,
    pub view: u64,
    pub block_hash: Hash,
    /// Aggregate of the Commit votes
    pub signature: BLSSignature,
    pub signers: SignerBitmap,
}

impl CommitCertificate {
    pub fn from_quorum(certificate: QuorumCertificate) -> Self {
        Self {
            height: certificate.height,
            view: certificate.view,
            block_hash: certificate.block_hash,
            signature: certificate.signature,
            signers: certificate.signers,
        }
    }

    /// Check the aggregate against the committee that produced it
    pub fn verify(&self, roster: &Roster) -> bool {
        let quorum = QuorumCertificate {
            kind: VoteKind::Commit,
            view: self.view,
            height: self.height,
            block_hash: self.block_hash,
            signers: self.signers.clone(),
            signature: self.signature.clone(),
        };
        quorum.verify(roster).is_ok()
    }
}

/// Side effects requested by the state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Broadcast { group: GroupId, bytes: Vec<u8> },
    SendTo { peer: PeerId, bytes: Vec<u8> },
    /// Schedule `on_timeout(token)` after the delay
    ArmTimer { token: TimerToken, after: Duration },
    CancelTimer { token: TimerToken },
    /// A block reached finality
    Commit(CommitCertificate),
    /// Too many view changes in a row without a commit
    LivenessAlarm { consecutive: u32 },
}

/// Snapshot for status readers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStatus {
    pub height: u64,
    pub view: u64,
    pub phase: Phase,
    /// Committee index of the current view's leader
    pub leader: u32,
    pub pending_view: Option<u64>,
    pub consecutive_view_changes: u32,
}

/// Two different blocks announced for one (view, height)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConflictEvidence {
    pub view: u64,
    pub height: u64,
    pub leader: u32,
    pub first: Hash,
    pub second: Hash,
}

/// Why an inbound message had no effect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    #[error("Malformed message: {0}")]
    Malformed(CodecError),
    #[error("Authentication failed: {0}")]
    Auth(AuthError),
    #[error("Message for view {view} is behind current view {current}")]
    StaleView { view: u64, current: u64 },
    #[error("View {view} is beyond the vote window")]
    OutOfWindow { view: u64 },
    #[error("Message for height {height} while at height {expected}")]
    WrongHeight { height: u64, expected: u64 },
    #[error("Member {sender} is not the leader of view {view}")]
    NotFromLeader { sender: u32, view: u64 },
    #[error("Conflicting proposal for view {view} height {height}")]
    ConflictingProposal { view: u64, height: u64 },
    #[error("Locked on {locked}, refusing to prepare {proposed}")]
    Locked { locked: Hash, proposed: Hash },
    #[error("Member {signer} voted twice in {kind} of view {view} height {height}")]
    EquivocatingVote { signer: u32, kind: VoteKind, view: u64, height: u64 },
    #[error("NewView header names view {header} but certifies view {certified}")]
    CertificateMismatch { header: u64, certified: u64 },
    #[error("Local signing failed: {0}")]
    Signing(SigningError),
    #[error("Vote rejected: {0}")]
    Aggregation(AggregationError),
}

impl From<AuthError> for DropReason {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Malformed(codec) => DropReason::Malformed(codec),
            other => DropReason::Auth(other),
        }
    }
}

impl DropReason {
    /// Routine drops caused by asynchronous delivery
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            DropReason::StaleView { .. } | DropReason::OutOfWindow { .. } | DropReason::WrongHeight { .. }
        )
    }
}

/// Errors returned to the embedding node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Local key is not a member of the committee")]
    NotAMember,
    #[error("Committee can only change between rounds (phase {0})")]
    RosterChangeMidRound(Phase),
    #[error("Cannot move from view {current} back to view {requested}")]
    ViewRegression { current: u64, requested: u64 },
    #[error("Invalid configuration: {0}")]
    Config(String),
}
