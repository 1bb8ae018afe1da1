// Committee roster
//
// Epoch-scoped mapping from member index to signing key and network
// identity. Leader selection and quorum size are pure functions of the
// member set and the view number.

use crate::crypto::BLSPublicKey;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("Committee is empty")]
    Empty,
    #[error("Duplicate public key for member {0}")]
    DuplicateKey(u32),
    #[error("Member at position {position} claims index {index}")]
    IndexMismatch { position: usize, index: u32 },
    #[error("Invalid quorum rule {numerator}/{denominator}")]
    InvalidQuorumRule { numerator: u32, denominator: u32 },
}

/// Fraction of the committee whose votes finalize a phase
///
/// quorum(N) = ceil(N * numerator / denominator), with the fraction in [2/3, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumRule {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for QuorumRule {
    fn default() -> Self {
        Self {
            numerator: 2,
            denominator: 3,
        }
    }
}

impl QuorumRule {
    pub fn validate(&self) -> Result<(), RosterError> {
        let (numerator, denominator) = (self.numerator as u64, self.denominator as u64);
        if denominator == 0 || numerator > denominator || numerator * 3 < denominator * 2 {
            return Err(RosterError::InvalidQuorumRule {
                numerator: self.numerator,
                denominator: self.denominator,
            });
        }
        Ok(())
    }

    pub fn quorum(&self, committee_size: usize) -> usize {
        let n = committee_size as u64 * self.numerator as u64;
        n.div_ceil(self.denominator as u64) as usize
    }
}

/// Deterministic leader selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeaderPolicy {
    /// members[(view + offset) mod N]
    RoundRobin { offset: u64 },
}

impl Default for LeaderPolicy {
    fn default() -> Self {
        LeaderPolicy::RoundRobin { offset: 0 }
    }
}

impl LeaderPolicy {
    pub fn leader_index(&self, view: u64, committee_size: usize) -> u32 {
        match self {
            LeaderPolicy::RoundRobin { offset } => {
                (view.wrapping_add(*offset) % committee_size as u64) as u32
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteePolicy {
    #[serde(default)]
    pub quorum: QuorumRule,
    #[serde(default)]
    pub leader: LeaderPolicy,
}

/// A committee member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub index: u32,
    pub public_key: BLSPublicKey,
    pub peer: PeerId,
}

impl Member {
    pub fn new(index: u32, public_key: BLSPublicKey, peer: PeerId) -> Self {
        Self {
            index,
            public_key,
            peer,
        }
    }
}

/// Committee for one epoch
#[derive(Debug, Clone)]
pub struct Roster {
    epoch: u64,
    members: Vec<Member>,
    by_key: HashMap<BLSPublicKey, u32>,
    policy: CommitteePolicy,
}

impl Roster {
    /// Build a roster; member indices must be 0..N-1 in order
    pub fn new(
        epoch: u64,
        members: Vec<Member>,
        policy: CommitteePolicy,
    ) -> Result<Self, RosterError> {
        if members.is_empty() {
            return Err(RosterError::Empty);
        }
        policy.quorum.validate()?;

        let mut by_key = HashMap::with_capacity(members.len());
        for (position, member) in members.iter().enumerate() {
            if member.index as usize != position {
                return Err(RosterError::IndexMismatch {
                    position,
                    index: member.index,
                });
            }
            if by_key.insert(member.public_key.clone(), member.index).is_some() {
                return Err(RosterError::DuplicateKey(member.index));
            }
        }

        Ok(Self {
            epoch,
            members,
            by_key,
            policy,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, index: u32) -> Option<&Member> {
        self.members.get(index as usize)
    }

    pub fn policy(&self) -> CommitteePolicy {
        self.policy
    }

    /// Leader for a view
    pub fn leader_for(&self, view: u64) -> &Member {
        let index = self.policy.leader.leader_index(view, self.members.len());
        &self.members[index as usize]
    }

    pub fn is_leader(&self, view: u64, index: u32) -> bool {
        self.leader_for(view).index == index
    }

    pub fn is_member(&self, public_key: &BLSPublicKey) -> bool {
        self.by_key.contains_key(public_key)
    }

    pub fn index_of(&self, public_key: &BLSPublicKey) -> Option<u32> {
        self.by_key.get(public_key).copied()
    }

    /// Distinct signers needed to finalize a phase
    pub fn quorum(&self) -> usize {
        self.policy.quorum.quorum(self.members.len())
    }

    /// f = floor((N - 1) / 3)
    pub fn max_faults(&self) -> usize {
        (self.members.len() - 1) / 3
    }

    /// Public keys of the given members, skipping indices outside the committee
    pub fn public_keys<I>(&self, indices: I) -> Vec<BLSPublicKey>
    where
        I: IntoIterator<Item = u32>,
    {
        indices
            .into_iter()
            .filter_map(|i| self.member(i).map(|m| m.public_key.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BLSSecretKey;
    use libp2p::identity::Keypair;

    fn roster(n: u32, policy: CommitteePolicy) -> Roster {
        let members = (0..n)
            .map(|i| {
                let sk = BLSSecretKey::from_seed(&[i as u8 + 1; 32]).unwrap();
                let peer = Keypair::generate_ed25519().public().to_peer_id();
                Member::new(i, sk.public_key(), peer)
            })
            .collect();
        Roster::new(1, members, policy).unwrap()
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(roster(4, CommitteePolicy::default()).quorum(), 3);
        assert_eq!(roster(7, CommitteePolicy::default()).quorum(), 5);
        assert_eq!(roster(10, CommitteePolicy::default()).quorum(), 7);
        assert_eq!(roster(1, CommitteePolicy::default()).quorum(), 1);
    }

    #[test]
    fn test_max_faults() {
        assert_eq!(roster(4, CommitteePolicy::default()).max_faults(), 1);
        assert_eq!(roster(7, CommitteePolicy::default()).max_faults(), 2);
    }

    #[test]
    fn test_leader_round_robin() {
        let r = roster(4, CommitteePolicy::default());
        assert_eq!(r.leader_for(0).index, 0);
        assert_eq!(r.leader_for(1).index, 1);
        assert_eq!(r.leader_for(2).index, 2);
        assert_eq!(r.leader_for(5).index, 1); // wraps
        assert!(r.is_leader(3, 3));
    }

    #[test]
    fn test_leader_offset() {
        let policy = CommitteePolicy {
            leader: LeaderPolicy::RoundRobin { offset: 2 },
            ..Default::default()
        };
        let r = roster(4, policy);
        assert_eq!(r.leader_for(1).index, 3);
        assert_eq!(r.leader_for(2).index, 0);
    }

    #[test]
    fn test_membership_lookup() {
        let r = roster(4, CommitteePolicy::default());
        let pk = r.member(2).unwrap().public_key.clone();
        assert!(r.is_member(&pk));
        assert_eq!(r.index_of(&pk), Some(2));

        let outsider = BLSSecretKey::generate().public_key();
        assert!(!r.is_member(&outsider));
        assert_eq!(r.index_of(&outsider), None);
    }

    #[test]
    fn test_rejects_bad_committees() {
        assert_eq!(
            Roster::new(0, vec![], CommitteePolicy::default()).unwrap_err(),
            RosterError::Empty
        );

        let sk = BLSSecretKey::generate();
        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let dup = vec![
            Member::new(0, sk.public_key(), peer),
            Member::new(1, sk.public_key(), peer),
        ];
        assert_eq!(
            Roster::new(0, dup, CommitteePolicy::default()).unwrap_err(),
            RosterError::DuplicateKey(1)
        );

        let skipped = vec![Member::new(1, sk.public_key(), peer)];
        assert!(matches!(
            Roster::new(0, skipped, CommitteePolicy::default()),
            Err(RosterError::IndexMismatch { position: 0, index: 1 })
        ));
    }

    #[test]
    fn test_invalid_quorum_rule() {
        let rule = |numerator, denominator| QuorumRule {
            numerator,
            denominator,
        };
        assert!(rule(4, 3).validate().is_err());
        assert!(rule(1, 0).validate().is_err());
        assert!(rule(0, 3).validate().is_err());
        // Two majorities of 1/2 need not overlap in an honest member
        assert_eq!(
            rule(1, 2).validate(),
            Err(RosterError::InvalidQuorumRule {
                numerator: 1,
                denominator: 2
            })
        );
        assert!(rule(2, 3).validate().is_ok());
        assert!(rule(3, 4).validate().is_ok());
        assert!(rule(1, 1).validate().is_ok());
    }
}
