// FBFT consensus state machine
//
// One block per round: the leader announces a block hash, members vote
// Prepare, then Commit, and a quorum of Commit votes finalizes the block.
// A round that fails to commit before its timer expires is abandoned
// through a view change that rotates the leader.
//
// A Prepare quorum locks a member on its block for the rest of the
// height. Locked members only Commit the block they are locked on, refuse
// to Prepare any other block, and hand the lock's certificate to the next
// leader with their ViewChange so it re-proposes the locked block.
//
// The machine is synchronous: every input returns the list of side
// effects (`Action`s) for the engine to carry out, so the protocol can be
// driven deterministically in tests.

pub mod engine;
pub mod types;


pub use engine::{BlockSink, ConsensusEngine, EngineError, EngineEvent, EngineHandle};
pub use types::{
    Action, BlockProposal, CommitCertificate, ConflictEvidence, ConsensusError, ConsensusStatus,
    DropReason, Phase, RoundState,
};

use crate::aggregator::{VoteAggregator, VoteKey, VoteOutcome};
use crate::config::ConsensusConfig;
use crate::crypto::{BLSSignature, Hash, KeyHandle};
use crate::message::{Authenticator, ConsensusMessage, Payload, QuorumCertificate, VoteKind};
use crate::network::GroupId;
use crate::pacemaker::{Pacemaker, TimerToken};
use crate::roster::Roster;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Conflict records kept for misbehaviour handling
const MAX_EVIDENCE: usize = 128;

/// Consensus participant for one shard committee
pub struct Consensus {
    config: ConsensusConfig,
    group: GroupId,
    auth: Authenticator,
    aggregator: VoteAggregator,
    pacemaker: Pacemaker,
    round: RoundState,
    started: bool,

    /// Block to announce the next time this node leads an idle round
    candidate: Option<Hash>,

    /// Highest Prepare certificate seen for the current height
    locked: Option<QuorumCertificate>,

    /// First block announced for each (view, height)
    announced: HashMap<(u64, u64), Hash>,
    evidence: Vec<ConflictEvidence>,

    /// Announce for the next height that arrived before the local commit
    deferred: Option<ConsensusMessage>,

    /// Announces held until their view is proven or the lock moves, by view
    pending: BTreeMap<u64, ConsensusMessage>,

    /// Certificate of the most recently installed view, for lagging peers
    view_proof: Option<QuorumCertificate>,
}

impl Consensus {
    /// Create a participant at height 1, view 1
    pub fn new(
        config: ConsensusConfig,
        roster: Roster,
        key: Arc<dyn KeyHandle>,
    ) -> Result<Self, ConsensusError> {
        config
            .validate()
            .map_err(|e| ConsensusError::Config(e.to_string()))?;
        check_policy(&config, &roster)?;

        let roster = Arc::new(roster);
        let auth = Authenticator::new(roster.clone(), key).map_err(|_| ConsensusError::NotAMember)?;
        let aggregator = VoteAggregator::new(roster.len(), roster.quorum(), config.vote_window);
        let pacemaker = Pacemaker::new(
            config.base_timeout(),
            config.max_timeout(),
            config.liveness_alarm_threshold,
        );

        Ok(Self {
            group: GroupId::shard(config.shard_id),
            config,
            auth,
            aggregator,
            pacemaker,
            round: RoundState::new(1, 1),
            started: false,
            candidate: None,
            locked: None,
            announced: HashMap::new(),
            evidence: Vec::new(),
            deferred: None,
            pending: BTreeMap::new(),
            view_proof: None,
        })
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn roster(&self) -> &Arc<Roster> {
        self.auth.roster()
    }

    pub fn local_index(&self) -> u32 {
        self.auth.local_index()
    }

    pub fn round(&self) -> &RoundState {
        &self.round
    }

    pub fn is_leader(&self) -> bool {
        self.roster().is_leader(self.round.view, self.local_index())
    }

    /// Block this node is locked on at the current height
    pub fn locked_block(&self) -> Option<Hash> {
        self.locked.as_ref().map(|c| c.block_hash)
    }

    /// Distinct signers counted for one tally
    pub fn votes(&self, key: &VoteKey) -> usize {
        self.aggregator.count(key)
    }

    /// Conflicting announcements observed so far
    pub fn conflicts(&self) -> &[ConflictEvidence] {
        &self.evidence
    }

    pub fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            height: self.round.height,
            view: self.round.view,
            phase: self.round.phase,
            leader: self.roster().leader_for(self.round.view).index,
            pending_view: self.pacemaker.pending_view(),
            consecutive_view_changes: self.pacemaker.consecutive_view_changes(),
        }
    }

    /// Arm the first round timer and propose if leading
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        info!(
            "Starting consensus as member {} at height {} view {}",
            self.local_index(),
            self.round.height,
            self.round.view
        );
        self.started = true;
        self.arm_timer(&mut actions);
        self.try_propose(&mut actions);
        actions
    }

    /// Hand over the next block to propose
    ///
    /// The block is announced right away if this node has started and
    /// leads an idle round, otherwise the next time it does.
    pub fn submit_block(&mut self, block_hash: Hash) -> Vec<Action> {
        let mut actions = Vec::new();
        debug!("New block candidate {}", block_hash);
        self.candidate = Some(block_hash);
        self.try_propose(&mut actions);
        actions
    }

    /// Process wire bytes from a committee member
    pub fn handle_message(&mut self, bytes: &[u8]) -> Result<Vec<Action>, DropReason> {
        let message = self.auth.open(bytes)?;
        let mut actions = Vec::new();
        self.dispatch(message, &mut actions)?;
        Ok(actions)
    }

    /// A timer armed through `Action::ArmTimer` expired
    pub fn on_timeout(&mut self, token: TimerToken) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.pacemaker.fire(token) {
            debug!("Ignoring cancelled timer {:?}", token);
            return actions;
        }

        warn!(
            "Round timed out at height {} view {} in phase {}",
            self.round.height, self.round.view, self.round.phase
        );
        let target = self.pacemaker.begin_view_change(self.round.view);
        self.request_view(target, &mut actions);
        actions
    }

    /// Force the current view, keeping the height and any lock
    pub fn set_view(&mut self, view: u64) -> Result<Vec<Action>, ConsensusError> {
        if view < self.round.view {
            return Err(ConsensusError::ViewRegression {
                current: self.round.view,
                requested: view,
            });
        }
        let mut actions = Vec::new();
        if view == self.round.view {
            return Ok(actions);
        }
        info!("View set externally to {}", view);
        self.aggregator.advance_floor(view);
        self.pacemaker.view_installed(view);
        self.round = RoundState::new(self.round.height, view);
        self.arm_timer(&mut actions);
        self.try_propose(&mut actions);
        self.replay_pending(&mut actions);
        Ok(actions)
    }

    /// Restart consensus at `height` after the node caught up out of band
    pub fn reset_height(&mut self, height: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        info!("Height reset to {} at view {}", height, self.round.view);
        self.round = RoundState::new(height, self.round.view);
        self.locked = None;
        self.aggregator.open_height(height);
        self.announced.retain(|(_, h), _| *h >= height);
        self.deferred = None;
        self.pending.clear();
        self.arm_timer(&mut actions);
        self.try_propose(&mut actions);
        actions
    }

    /// Switch to the next epoch's committee between rounds
    pub fn install_roster(&mut self, roster: Roster) -> Result<(), ConsensusError> {
        if self.round.phase != Phase::Idle {
            return Err(ConsensusError::RosterChangeMidRound(self.round.phase));
        }
        check_policy(&self.config, &roster)?;
        let roster = Arc::new(roster);
        self.auth
            .set_roster(roster.clone())
            .map_err(|_| ConsensusError::NotAMember)?;
        self.aggregator.reset(roster.len(), roster.quorum());
        // Certificates of the old committee no longer verify
        self.view_proof = None;
        self.locked = None;
        self.pending.clear();
        info!(
            "Installed committee for epoch {} ({} members, quorum {})",
            roster.epoch(),
            roster.len(),
            roster.quorum()
        );
        Ok(())
    }

    fn dispatch(
        &mut self,
        message: ConsensusMessage,
        actions: &mut Vec<Action>,
    ) -> Result<(), DropReason> {
        match &message.payload {
            Payload::Announce { height } => {
                let height = *height;
                self.on_announce(message, height, actions)
            }
            Payload::Prepare { height, vote } => {
                self.on_vote(&message, VoteKind::Prepare, *height, vote.clone(), actions)
            }
            Payload::Commit { height, vote } => {
                self.on_vote(&message, VoteKind::Commit, *height, vote.clone(), actions)
            }
            Payload::ViewChange {
                new_view,
                prepared,
                vote,
                ..
            } => {
                if let Some(prepared) = prepared {
                    if self.note_prepared(prepared) {
                        self.replay_pending(actions);
                    }
                }
                let target = *new_view;
                if target <= self.round.view {
                    return self.help_lagging(message.sender_index, target, actions);
                }
                self.tally(
                    VoteKey::view_change(target),
                    message.sender_index,
                    vote.clone(),
                    actions,
                )
            }
            Payload::NewView {
                certificate,
                prepared,
            } => {
                if certificate.view != message.view {
                    return Err(DropReason::CertificateMismatch {
                        header: message.view,
                        certified: certificate.view,
                    });
                }
                self.check_view(message.view)?;
                let relocked = prepared.as_ref().map_or(false, |p| self.note_prepared(p));
                if message.view > self.round.view {
                    info!(
                        "NewView from member {} proves view {}",
                        message.sender_index, message.view
                    );
                    self.install_view(message.view, certificate.clone(), actions);
                } else if relocked {
                    self.replay_pending(actions);
                }
                Ok(())
            }
        }
    }

    fn check_view(&self, view: u64) -> Result<(), DropReason> {
        if view < self.round.view {
            return Err(DropReason::StaleView {
                view,
                current: self.round.view,
            });
        }
        Ok(())
    }

    fn on_vote(
        &mut self,
        message: &ConsensusMessage,
        kind: VoteKind,
        height: u64,
        vote: BLSSignature,
        actions: &mut Vec<Action>,
    ) -> Result<(), DropReason> {
        self.check_view(message.view)?;
        if height > self.round.height + 1 {
            return Err(DropReason::WrongHeight {
                height,
                expected: self.round.height,
            });
        }
        let key = VoteKey::new(message.view, height, message.block_hash, kind);
        self.tally(key, message.sender_index, vote, actions)
    }

    fn on_announce(
        &mut self,
        message: ConsensusMessage,
        height: u64,
        actions: &mut Vec<Action>,
    ) -> Result<(), DropReason> {
        let view = message.view;
        let block_hash = message.block_hash;
        let sender = message.sender_index;

        self.check_view(view)?;
        if !self.roster().is_leader(view, sender) {
            return Err(DropReason::NotFromLeader { sender, view });
        }
        if view > self.aggregator.floor().saturating_add(self.config.vote_window) {
            return Err(DropReason::OutOfWindow { view });
        }

        if height == self.round.height + 1 {
            debug!("Deferring Announce for height {} until height {} commits", height, self.round.height);
            self.deferred = Some(message);
            return Ok(());
        }
        if height != self.round.height {
            return Err(DropReason::WrongHeight {
                height,
                expected: self.round.height,
            });
        }

        if view > self.round.view {
            debug!("Holding Announce for view {} until a NewView proves it", view);
            self.pending.entry(view).or_insert(message);
            return Ok(());
        }

        if let Some(first) = self.announced.get(&(view, height)).copied() {
            if first == block_hash {
                return Ok(());
            }
            warn!(
                "Leader {} announced {} and {} for view {} height {}",
                sender, first, block_hash, view, height
            );
            if self.evidence.len() < MAX_EVIDENCE {
                self.evidence.push(ConflictEvidence {
                    view,
                    height,
                    leader: sender,
                    first,
                    second: block_hash,
                });
            }
            return Err(DropReason::ConflictingProposal { view, height });
        }

        if let Some(locked) = self.locked_block() {
            if locked != block_hash {
                info!(
                    "Locked on {} at height {}, not preparing {} from leader {}",
                    locked, height, block_hash, sender
                );
                self.pending.insert(view, message);
                return Err(DropReason::Locked {
                    locked,
                    proposed: block_hash,
                });
            }
        }

        let proposal = BlockProposal {
            block_hash,
            height,
            leader: sender,
        };

        if self.round.phase == Phase::ViewChanging {
            info!(
                "Noting block {} for height {} view {} without voting, view change under way",
                block_hash, height, view
            );
            self.announced.insert((view, height), block_hash);
            self.round.proposal = Some(proposal);
            self.advance(actions);
            return Ok(());
        }

        // Sign before touching state so a key failure leaves the round as it was
        let vote = self
            .auth
            .vote(VoteKind::Prepare, view, height, &block_hash)
            .map_err(DropReason::Signing)?;

        self.announced.insert((view, height), block_hash);
        self.adopt(proposal, vote, actions);
        Ok(())
    }

    /// Take on a proposal for the current round and vote Prepare
    fn adopt(&mut self, proposal: BlockProposal, vote: BLSSignature, actions: &mut Vec<Action>) {
        self.round.proposal = Some(proposal);
        if self.round.phase == Phase::Idle {
            self.round.phase = Phase::Announced;
        }
        info!(
            "Adopted block {} for height {} view {} from leader {}",
            proposal.block_hash, proposal.height, self.round.view, proposal.leader
        );
        self.publish(
            self.round.view,
            proposal.block_hash,
            Payload::Prepare {
                height: proposal.height,
                vote,
            },
            actions,
        );
    }

    fn try_propose(&mut self, actions: &mut Vec<Action>) {
        if !self.started || self.round.phase != Phase::Idle || !self.is_leader() {
            return;
        }
        if let Some(block_hash) = self.locked_block().or(self.candidate) {
            self.announce(block_hash, actions);
        }
    }

    /// Leader side of the Announce phase
    fn announce(&mut self, block_hash: Hash, actions: &mut Vec<Action>) {
        let view = self.round.view;
        let height = self.round.height;

        let vote = match self.auth.vote(VoteKind::Prepare, view, height, &block_hash) {
            Ok(vote) => vote,
            Err(e) => {
                warn!("Skipping proposal for height {}: {}", height, e);
                return;
            }
        };

        let announce = self
            .auth
            .populate(view, block_hash, Payload::Announce { height });
        if !self.broadcast(announce, actions) {
            return;
        }

        info!("Announcing block {} for height {} view {}", block_hash, height, view);
        self.announced.insert((view, height), block_hash);
        self.adopt(
            BlockProposal {
                block_hash,
                height,
                leader: self.local_index(),
            },
            vote,
            actions,
        );
    }

    /// Record a verified vote and react to the new tally
    fn tally(
        &mut self,
        key: VoteKey,
        signer: u32,
        signature: BLSSignature,
        actions: &mut Vec<Action>,
    ) -> Result<(), DropReason> {
        let outcome = self
            .aggregator
            .add_vote(key, signer, signature)
            .map_err(DropReason::Aggregation)?;

        match outcome {
            VoteOutcome::DuplicateIgnored | VoteOutcome::StaleVote => {}
            VoteOutcome::OutOfWindow => return Err(DropReason::OutOfWindow { view: key.view }),
            VoteOutcome::Equivocation { first } => {
                warn!(
                    "Member {} voted {} for both {} and {} in view {} height {}",
                    signer, key.kind, first, key.block_hash, key.view, key.height
                );
                return Err(DropReason::EquivocatingVote {
                    signer,
                    kind: key.kind,
                    view: key.view,
                    height: key.height,
                });
            }
            VoteOutcome::Accepted { count } if key.kind == VoteKind::ViewChange => {
                self.maybe_join(key.view, count, actions);
            }
            VoteOutcome::QuorumReached(certificate) if key.kind == VoteKind::ViewChange => {
                self.install_view(key.view, certificate, actions);
            }
            VoteOutcome::QuorumReached(certificate) if key.kind == VoteKind::Prepare => {
                if self.note_prepared(&certificate) {
                    self.replay_pending(actions);
                }
                self.advance(actions);
            }
            VoteOutcome::Accepted { .. } | VoteOutcome::QuorumReached(_) => self.advance(actions),
        }
        Ok(())
    }

    /// Lock on a Prepare certificate for the current height if it is newer
    /// than the lock held; true when the lock moved
    fn note_prepared(&mut self, certificate: &QuorumCertificate) -> bool {
        if certificate.kind != VoteKind::Prepare || certificate.height != self.round.height {
            return false;
        }
        if self.locked.as_ref().map_or(false, |l| l.view >= certificate.view) {
            return false;
        }
        info!(
            "Locked on block {} at height {} by view {} certificate",
            certificate.block_hash, certificate.height, certificate.view
        );
        self.locked = Some(certificate.clone());
        true
    }

    fn locked_in(&self, view: u64, block_hash: Hash) -> bool {
        self.locked
            .as_ref()
            .map_or(false, |l| l.view == view && l.block_hash == block_hash)
    }

    /// Move the round forward as far as the tallies allow
    fn advance(&mut self, actions: &mut Vec<Action>) {
        let Some(proposal) = self.round.proposal else {
            return;
        };
        let view = self.round.view;

        let commit_key = VoteKey::new(view, proposal.height, proposal.block_hash, VoteKind::Commit);
        if let Some(certificate) = self.aggregator.certificate(&commit_key) {
            self.commit(proposal, certificate, actions);
            return;
        }

        if !self.locked_in(view, proposal.block_hash) {
            let prepare_key =
                VoteKey::new(view, proposal.height, proposal.block_hash, VoteKind::Prepare);
            if let Some(certificate) = self.aggregator.certificate(&prepare_key) {
                self.note_prepared(&certificate);
            }
        }
        if self.round.commit_sent
            || self.round.phase == Phase::ViewChanging
            || !self.locked_in(view, proposal.block_hash)
        {
            return;
        }

        let vote = match self
            .auth
            .vote(VoteKind::Commit, view, proposal.height, &proposal.block_hash)
        {
            Ok(vote) => vote,
            Err(e) => {
                warn!("Cannot vote Commit on {}: {}", proposal.block_hash, e);
                return;
            }
        };
        self.round.commit_sent = true;
        if self.round.phase == Phase::Announced {
            self.round.phase = Phase::Prepared;
        }
        info!(
            "Prepare quorum for block {} at height {} view {}",
            proposal.block_hash, proposal.height, view
        );
        self.publish(
            view,
            proposal.block_hash,
            Payload::Commit {
                height: proposal.height,
                vote,
            },
            actions,
        );
    }

    fn commit(
        &mut self,
        proposal: BlockProposal,
        certificate: QuorumCertificate,
        actions: &mut Vec<Action>,
    ) {
        let view = self.round.view;
        self.round.phase = Phase::Committed;
        info!(
            "Committed block {} at height {} view {} with {} signers",
            proposal.block_hash,
            proposal.height,
            view,
            certificate.signers.count()
        );

        actions.push(Action::Commit(CommitCertificate::from_quorum(certificate)));
        self.pacemaker.record_progress();
        if self.candidate == Some(proposal.block_hash) {
            self.candidate = None;
        }

        let next = proposal.height + 1;
        self.aggregator.open_height(next);
        self.locked = None;
        self.pending.clear();
        self.announced.retain(|(_, h), _| *h >= next);
        self.round = RoundState::new(next, view);
        self.arm_timer(actions);
        self.try_propose(actions);

        if let Some(deferred) = self.deferred.take() {
            if let Err(reason) = self.dispatch(deferred, actions) {
                debug!("Deferred Announce dropped: {}", reason);
            }
        }
    }

    /// Join a view change once f+1 members ask for it
    fn maybe_join(&mut self, target: u64, count: usize, actions: &mut Vec<Action>) {
        let already = self.pacemaker.pending_view().map_or(false, |p| p >= target);
        if already || count <= self.roster().max_faults() {
            return;
        }
        info!("Joining view change to {} ({} members asked)", target, count);
        self.pacemaker.join_view_change(target);
        self.request_view(target, actions);
    }

    /// Vote to move to `target` and re-arm the timer with backoff
    fn request_view(&mut self, target: u64, actions: &mut Vec<Action>) {
        self.round.phase = Phase::ViewChanging;
        self.arm_timer(actions);

        if self.pacemaker.liveness_alarm() {
            let consecutive = self.pacemaker.consecutive_view_changes();
            error!(
                "Liveness alarm: {} consecutive view changes without a commit at height {}",
                consecutive, self.round.height
            );
            actions.push(Action::LivenessAlarm { consecutive });
        }

        let vote = match self.auth.vote(VoteKind::ViewChange, target, 0, &Hash::ZERO) {
            Ok(vote) => vote,
            Err(e) => {
                warn!("Sitting out view change to {}: {}", target, e);
                return;
            }
        };
        info!("Requesting view change {} -> {}", self.round.view, target);
        self.publish(
            self.round.view,
            Hash::ZERO,
            Payload::ViewChange {
                new_view: target,
                height: self.round.height,
                prepared: self.locked.clone(),
                vote,
            },
            actions,
        );
    }

    /// Enter a higher view with a fresh round at the same height
    fn install_view(&mut self, view: u64, certificate: QuorumCertificate, actions: &mut Vec<Action>) {
        if view <= self.round.view {
            return;
        }
        let in_flight = self.round.proposal.map(|p| p.block_hash);

        self.aggregator.advance_floor(view);
        self.pacemaker.view_installed(view);
        self.round = RoundState::new(self.round.height, view);
        let leader = self.roster().leader_for(view).index;
        info!("Installed view {} with leader {}", view, leader);
        self.arm_timer(actions);

        if leader == self.local_index() {
            let new_view = self.auth.populate(
                view,
                Hash::ZERO,
                Payload::NewView {
                    certificate: certificate.clone(),
                    prepared: self.locked.clone(),
                },
            );
            self.broadcast(new_view, actions);
        }
        self.view_proof = Some(certificate);

        if leader == self.local_index() && self.started {
            if let Some(block_hash) = self.locked_block().or(in_flight).or(self.candidate) {
                self.announce(block_hash, actions);
            }
        }
        self.replay_pending(actions);
    }

    /// Feed back the held Announce for the current view, if any
    fn replay_pending(&mut self, actions: &mut Vec<Action>) {
        let view = self.round.view;
        self.pending = self.pending.split_off(&view);
        if let Some(message) = self.pending.remove(&view) {
            if let Err(reason) = self.dispatch(message, actions) {
                debug!("Held Announce for view {} dropped: {}", view, reason);
            }
        }
    }

    /// Answer an outdated ViewChange with the proof of the current view
    fn help_lagging(
        &mut self,
        sender: u32,
        target: u64,
        actions: &mut Vec<Action>,
    ) -> Result<(), DropReason> {
        let stale = DropReason::StaleView {
            view: target,
            current: self.round.view,
        };
        let Some(proof) = self.view_proof.clone() else {
            return Err(stale);
        };
        if proof.view != self.round.view {
            return Err(stale);
        }
        let Some(peer) = self.roster().member(sender).map(|m| m.peer) else {
            return Err(stale);
        };

        let message = self.auth.populate(
            proof.view,
            Hash::ZERO,
            Payload::NewView {
                certificate: proof,
                prepared: self.locked.clone(),
            },
        );
        match self.auth.seal(message) {
            Ok(bytes) => {
                debug!("Sending view {} proof to lagging member {}", self.round.view, sender);
                actions.push(Action::SendTo { peer, bytes });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to seal NewView: {}", e);
                Err(stale)
            }
        }
    }

    /// Broadcast a message carrying a local vote and count the vote
    fn publish(&mut self, view: u64, block_hash: Hash, payload: Payload, actions: &mut Vec<Action>) {
        let message = self.auth.populate(view, block_hash, payload);
        let vote = message.vote().map(|v| {
            (
                VoteKey::new(v.view, v.height, v.block_hash, v.kind),
                v.signature.clone(),
            )
        });
        self.broadcast(message, actions);

        if let Some((key, signature)) = vote {
            let local = self.local_index();
            if let Err(reason) = self.tally(key, local, signature, actions) {
                debug!("Own {} vote not counted: {}", key.kind, reason);
            }
        }
    }

    fn broadcast(&self, message: ConsensusMessage, actions: &mut Vec<Action>) -> bool {
        let name = message.payload.name();
        match self.auth.seal(message) {
            Ok(bytes) => {
                actions.push(Action::Broadcast {
                    group: self.group.clone(),
                    bytes,
                });
                true
            }
            Err(e) => {
                warn!("Failed to sign {} message: {}", name, e);
                false
            }
        }
    }

    fn arm_timer(&mut self, actions: &mut Vec<Action>) {
        let (replaced, token, after) = self.pacemaker.arm();
        if let Some(old) = replaced {
            actions.push(Action::CancelTimer { token: old });
        }
        actions.push(Action::ArmTimer { token, after });
    }
}

/// The committee must run under the policy the node is configured for
fn check_policy(config: &ConsensusConfig, roster: &Roster) -> Result<(), ConsensusError> {
    if roster.policy() != config.committee {
        return Err(ConsensusError::Config(format!(
            "committee policy {:?} does not match configured {:?}",
            roster.policy(),
            config.committee
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_data, BLSSecretKey, LocalKey};
    use crate::roster::{CommitteePolicy, LeaderPolicy, Member, QuorumRule};
    use libp2p::identity::Keypair;

    fn setup(n: u8, index: usize) -> (Consensus, Vec<Arc<LocalKey>>) {
        let keys: Vec<Arc<LocalKey>> = (0..n)
            .map(|i| Arc::new(LocalKey::new(BLSSecretKey::from_seed(&[i + 60; 32]).unwrap())))
            .collect();
        let members = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let peer = Keypair::generate_ed25519().public().to_peer_id();
                Member::new(i as u32, k.public_key(), peer)
            })
            .collect();
        let roster = Roster::new(1, members, CommitteePolicy::default()).unwrap();
        let consensus =
            Consensus::new(ConsensusConfig::default(), roster, keys[index].clone()).unwrap();
        (consensus, keys)
    }

    fn broadcasts(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Broadcast { .. }))
            .count()
    }

    #[test]
    fn test_initial_status() {
        let (consensus, _) = setup(4, 0);
        let status = consensus.status();
        assert_eq!(status.height, 1);
        assert_eq!(status.view, 1);
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.leader, 1);
        assert_eq!(status.pending_view, None);
        assert!(!consensus.is_leader());
    }

    #[test]
    fn test_outsider_key_rejected() {
        let (consensus, _) = setup(4, 0);
        let outsider = Arc::new(LocalKey::new(BLSSecretKey::from_seed(&[200; 32]).unwrap()));
        let roster = (**consensus.roster()).clone();
        assert_eq!(
            Consensus::new(ConsensusConfig::default(), roster, outsider).err(),
            Some(ConsensusError::NotAMember)
        );
    }

    #[test]
    fn test_leader_announces_on_start() {
        let (mut leader, _) = setup(4, 1);
        leader.submit_block(hash_data(b"block 1"));
        assert_eq!(leader.round().phase, Phase::Idle);

        let actions = leader.start();
        // Announce + own Prepare
        assert_eq!(broadcasts(&actions), 2);
        assert!(matches!(actions[0], Action::ArmTimer { .. }));
        assert_eq!(leader.round().phase, Phase::Announced);
        assert_eq!(
            leader.round().proposal.map(|p| p.block_hash),
            Some(hash_data(b"block 1"))
        );
    }

    #[test]
    fn test_no_announce_before_start() {
        let (mut leader, _) = setup(4, 1);
        let actions = leader.submit_block(hash_data(b"early"));
        assert!(actions.is_empty());
        assert_eq!(leader.round().proposal, None);
    }

    #[test]
    fn test_committee_policy_must_match_config() {
        let (mut node, keys) = setup(4, 0);
        let roster = (**node.roster()).clone();

        let mut config = ConsensusConfig::default();
        config.committee.leader = LeaderPolicy::RoundRobin { offset: 1 };
        assert!(matches!(
            Consensus::new(config, roster.clone(), keys[0].clone()),
            Err(ConsensusError::Config(_))
        ));

        let stricter = CommitteePolicy {
            quorum: QuorumRule {
                numerator: 3,
                denominator: 4,
            },
            ..CommitteePolicy::default()
        };
        let next = Roster::new(2, roster.members().to_vec(), stricter).unwrap();
        assert!(matches!(node.install_roster(next), Err(ConsensusError::Config(_))));
        assert_eq!(node.roster().epoch(), 1);
    }

    #[test]
    fn test_follower_does_not_propose() {
        let (mut follower, _) = setup(4, 2);
        follower.start();
        let actions = follower.submit_block(hash_data(b"block"));
        assert!(actions.is_empty());
        assert_eq!(follower.round().phase, Phase::Idle);
    }

    #[test]
    fn test_timeout_starts_view_change() {
        let (mut node, _) = setup(4, 0);
        let token = match node.start()[0] {
            Action::ArmTimer { token, .. } => token,
            ref other => panic!("unexpected action {:?}", other),
        };

        let actions = node.on_timeout(token);
        assert_eq!(node.round().phase, Phase::ViewChanging);
        assert_eq!(node.status().pending_view, Some(2));
        assert_eq!(broadcasts(&actions), 1);

        // Backoff doubles the next timeout
        let after = actions.iter().find_map(|a| match a {
            Action::ArmTimer { after, .. } => Some(*after),
            _ => None,
        });
        assert_eq!(after, Some(node.config().base_timeout() * 2));

        // The fired token is spent
        assert!(node.on_timeout(token).is_empty());
    }

    #[test]
    fn test_liveness_alarm_after_threshold() {
        let (mut node, _) = setup(4, 0);
        let mut token = match node.start()[0] {
            Action::ArmTimer { token, .. } => token,
            ref other => panic!("unexpected action {:?}", other),
        };

        let mut alarms = 0;
        for _ in 0..5 {
            let actions = node.on_timeout(token);
            for action in &actions {
                match action {
                    Action::ArmTimer { token: t, .. } => token = *t,
                    Action::LivenessAlarm { consecutive } => {
                        assert_eq!(*consecutive, 5);
                        alarms += 1;
                    }
                    _ => {}
                }
            }
        }
        assert_eq!(alarms, 1);
        assert_eq!(node.status().pending_view, Some(6));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let (mut node, _) = setup(4, 0);
        assert!(matches!(
            node.handle_message(&[1, 2, 3]),
            Err(DropReason::Malformed(_))
        ));
    }

    #[test]
    fn test_set_view_and_reset_height() {
        let (mut node, _) = setup(4, 0);
        node.start();

        node.set_view(4).unwrap();
        assert_eq!(node.status().view, 4);
        assert_eq!(node.status().leader, 0);
        assert_eq!(
            node.set_view(3).unwrap_err(),
            ConsensusError::ViewRegression {
                current: 4,
                requested: 3
            }
        );

        node.reset_height(10);
        assert_eq!(node.status().height, 10);
        assert_eq!(node.status().phase, Phase::Idle);
    }

    #[test]
    fn test_install_roster_between_rounds_only() {
        let (mut leader, _) = setup(4, 1);
        let roster = (**leader.roster()).clone();
        assert!(leader.install_roster(roster.clone()).is_ok());

        leader.submit_block(hash_data(b"block"));
        leader.start();
        assert_eq!(
            leader.install_roster(roster),
            Err(ConsensusError::RosterChangeMidRound(Phase::Announced))
        );
    }
}
