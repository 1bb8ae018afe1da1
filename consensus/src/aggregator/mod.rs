// Vote aggregation
//
// Counts at most one vote per signer for each (view, height, phase) and
// combines a quorum of votes on one block into a certificate. Tallies keep
// votes in a BTreeMap keyed by signer index, so the certificate is the
// same no matter which order the network delivered the votes in.

use crate::crypto::{aggregate_signatures, BLSError, BLSSignature, Hash};
use crate::message::{QuorumCertificate, SignerBitmap, VoteKind};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Signer {signer} outside committee of {committee_size}")]
    SignerOutOfRange { signer: u32, committee_size: usize },
    #[error("Failed to aggregate signatures: {0}")]
    Bls(#[from] BLSError),
}

/// Identifies one tally
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VoteKey {
    pub view: u64,
    pub height: u64,
    pub block_hash: Hash,
    pub kind: VoteKind,
}

impl VoteKey {
    pub fn new(view: u64, height: u64, block_hash: Hash, kind: VoteKind) -> Self {
        Self {
            view,
            height,
            block_hash,
            kind,
        }
    }

    /// Votes to enter `target`; these name no block
    pub fn view_change(target: u64) -> Self {
        Self::new(target, 0, Hash::ZERO, VoteKind::ViewChange)
    }

    fn ballot(&self, signer: u32) -> Ballot {
        Ballot {
            view: self.view,
            height: self.height,
            kind: self.kind,
            signer,
        }
    }
}

/// One signer's single vote in a (view, height, phase)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Ballot {
    view: u64,
    height: u64,
    kind: VoteKind,
    signer: u32,
}

/// Result of recording a vote
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Counted; quorum not reached yet
    Accepted { count: usize },
    /// Signer already counted for this tally
    DuplicateIgnored,
    /// Signer already voted for `first` in this view, height and phase
    Equivocation { first: Hash },
    /// Counted and the tally holds a quorum; certificate covers every signer so far
    QuorumReached(QuorumCertificate),
    /// View or height is below the floor
    StaleVote,
    /// View is too far above the floor to track
    OutOfWindow,
}

#[derive(Debug, Default)]
struct Tally {
    votes: BTreeMap<u32, BLSSignature>,
}

pub struct VoteAggregator {
    committee_size: usize,
    quorum: usize,
    /// Votes below this view are stale
    floor: u64,
    /// Votes above floor + window are dropped
    window: u64,
    /// Prepare/Commit votes below this height are stale
    height_floor: u64,
    tallies: HashMap<VoteKey, Tally>,
    ballots: HashMap<Ballot, Hash>,
}

impl VoteAggregator {
    pub fn new(committee_size: usize, quorum: usize, window: u64) -> Self {
        Self {
            committee_size,
            quorum,
            floor: 0,
            window,
            height_floor: 0,
            tallies: HashMap::new(),
            ballots: HashMap::new(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Record one verified vote
    pub fn add_vote(
        &mut self,
        key: VoteKey,
        signer: u32,
        signature: BLSSignature,
    ) -> Result<VoteOutcome, AggregationError> {
        if signer as usize >= self.committee_size {
            return Err(AggregationError::SignerOutOfRange {
                signer,
                committee_size: self.committee_size,
            });
        }
        if key.view < self.floor {
            debug!("Dropping stale {} vote from {} for view {} (floor {})", key.kind, signer, key.view, self.floor);
            return Ok(VoteOutcome::StaleVote);
        }
        if key.view > self.floor.saturating_add(self.window) {
            debug!("Dropping {} vote from {} for far-future view {}", key.kind, signer, key.view);
            return Ok(VoteOutcome::OutOfWindow);
        }
        if key.kind != VoteKind::ViewChange && key.height < self.height_floor {
            debug!("Dropping {} vote from {} for finished height {}", key.kind, signer, key.height);
            return Ok(VoteOutcome::StaleVote);
        }

        match self.ballots.get(&key.ballot(signer)) {
            Some(first) if *first == key.block_hash => return Ok(VoteOutcome::DuplicateIgnored),
            Some(first) => return Ok(VoteOutcome::Equivocation { first: *first }),
            None => {}
        }
        self.ballots.insert(key.ballot(signer), key.block_hash);

        let tally = self.tallies.entry(key).or_default();
        tally.votes.insert(signer, signature);

        let count = tally.votes.len();
        if count < self.quorum {
            return Ok(VoteOutcome::Accepted { count });
        }

        let certificate = self.build_certificate(&key)?;
        Ok(VoteOutcome::QuorumReached(certificate))
    }

    /// Distinct signers counted for a tally
    pub fn count(&self, key: &VoteKey) -> usize {
        self.tallies.get(key).map_or(0, |t| t.votes.len())
    }

    pub fn has_quorum(&self, key: &VoteKey) -> bool {
        self.count(key) >= self.quorum
    }

    /// Certificate for a tally that holds a quorum
    pub fn certificate(&self, key: &VoteKey) -> Option<QuorumCertificate> {
        if !self.has_quorum(key) {
            return None;
        }
        self.build_certificate(key).ok()
    }

    fn build_certificate(&self, key: &VoteKey) -> Result<QuorumCertificate, AggregationError> {
        let votes = self
            .tallies
            .get(key)
            .map(|t| &t.votes)
            .ok_or(BLSError::EmptyAggregate)?;

        let signature = aggregate_signatures(votes.values())?;
        Ok(QuorumCertificate {
            kind: key.kind,
            view: key.view,
            height: key.height,
            block_hash: key.block_hash,
            signers: SignerBitmap::from_indices(self.committee_size, votes.keys().copied()),
            signature,
        })
    }

    /// Raise the floor and discard everything below it
    pub fn advance_floor(&mut self, view: u64) {
        if view <= self.floor {
            return;
        }
        self.floor = view;
        self.tallies.retain(|key, _| key.view >= view);
        self.ballots.retain(|ballot, _| ballot.view >= view);
    }

    /// Start counting `height`; Prepare/Commit votes for lower heights are
    /// discarded and refused from now on
    pub fn open_height(&mut self, height: u64) {
        if height <= self.height_floor {
            return;
        }
        self.height_floor = height;
        let keep = |kind: VoteKind, h: u64| kind == VoteKind::ViewChange || h >= height;
        self.tallies.retain(|key, _| keep(key.kind, key.height));
        self.ballots.retain(|ballot, _| keep(ballot.kind, ballot.height));
    }

    /// Drop all tallies (committee change)
    pub fn reset(&mut self, committee_size: usize, quorum: usize) {
        self.committee_size = committee_size;
        self.quorum = quorum;
        self.tallies.clear();
        self.ballots.clear();
    }

    pub fn tally_count(&self) -> usize {
        self.tallies.len()
    }
}
