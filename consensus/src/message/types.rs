// Consensus message types
//
// One tagged variant per protocol step. Votes carry a second BLS
// signature over the vote digest so that a quorum of them aggregates into
// a single certificate.

use super::codec::vote_digest;
use crate::crypto::{verify_aggregate, BLSPublicKey, BLSSignature, Hash};
use crate::roster::Roster;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire tag for each message variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    Announce = 1,
    Prepare = 2,
    Commit = 3,
    ViewChange = 4,
    NewView = 5,
}

impl MessageTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageTag::Announce),
            2 => Some(MessageTag::Prepare),
            3 => Some(MessageTag::Commit),
            4 => Some(MessageTag::ViewChange),
            5 => Some(MessageTag::NewView),
            _ => None,
        }
    }
}

/// Phases that collect votes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteKind {
    Prepare,
    Commit,
    ViewChange,
}

impl VoteKind {
    pub fn tag(&self) -> MessageTag {
        match self {
            VoteKind::Prepare => MessageTag::Prepare,
            VoteKind::Commit => MessageTag::Commit,
            VoteKind::ViewChange => MessageTag::ViewChange,
        }
    }
}

impl fmt::Display for VoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoteKind::Prepare => "prepare",
            VoteKind::Commit => "commit",
            VoteKind::ViewChange => "view-change",
        };
        f.write_str(name)
    }
}

/// Bit i set means committee member i signed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerBitmap {
    bits: Vec<u8>,
}

impl SignerBitmap {
    /// Empty bitmap sized for a committee
    pub fn with_capacity(committee_size: usize) -> Self {
        Self {
            bits: vec![0u8; committee_size.div_ceil(8)],
        }
    }

    pub fn from_indices<I>(committee_size: usize, indices: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let mut bitmap = Self::with_capacity(committee_size);
        for index in indices {
            bitmap.set(index);
        }
        bitmap
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bits: bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn set(&mut self, index: u32) {
        let byte = index as usize / 8;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << (index % 8);
    }

    pub fn contains(&self, index: u32) -> bool {
        self.bits
            .get(index as usize / 8)
            .map_or(false, |b| b & (1 << (index % 8)) != 0)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Set indices in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter().enumerate().flat_map(|(byte, bits)| {
            (0..8u32)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| byte as u32 * 8 + bit)
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("Certificate has {have} signers, quorum is {need}")]
    TooFewSigners { have: usize, need: usize },
    #[error("Signer {0} is not in the committee")]
    SignerOutOfRange(u32),
    #[error("Aggregate signature does not verify")]
    BadSignature,
    #[error("Expected a {expected} certificate, got {got}")]
    KindMismatch { expected: VoteKind, got: VoteKind },
    #[error("Certificate for height {got} where height {expected} was claimed")]
    HeightMismatch { expected: u64, got: u64 },
}

/// Aggregate of a quorum of votes on one (view, height, block hash, phase)
///
/// View-change certificates name no block: height 0 and the zero hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuorumCertificate {
    pub kind: VoteKind,
    pub view: u64,
    pub height: u64,
    pub block_hash: Hash,
    pub signers: SignerBitmap,
    pub signature: BLSSignature,
}

impl QuorumCertificate {
    /// Bytes every signer signed
    pub fn digest(&self) -> Vec<u8> {
        vote_digest(self.kind, self.view, self.height, &self.block_hash)
    }

    /// Kind check followed by `verify`
    pub fn verify_kind(&self, expected: VoteKind, roster: &Roster) -> Result<(), CertificateError> {
        if self.kind != expected {
            return Err(CertificateError::KindMismatch {
                expected,
                got: self.kind,
            });
        }
        self.verify(roster)
    }

    /// Check signer membership, quorum size and the aggregate signature
    pub fn verify(&self, roster: &Roster) -> Result<(), CertificateError> {
        if let Some(outsider) = self.signers.iter().find(|i| *i as usize >= roster.len()) {
            return Err(CertificateError::SignerOutOfRange(outsider));
        }

        let have = self.signers.count();
        let need = roster.quorum();
        if have < need {
            return Err(CertificateError::TooFewSigners { have, need });
        }

        let keys: Vec<BLSPublicKey> = roster.public_keys(self.signers.iter());
        match verify_aggregate(&self.digest(), &self.signature, &keys) {
            Ok(true) => Ok(()),
            _ => Err(CertificateError::BadSignature),
        }
    }
}

/// Phase-specific message content
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Leader proposes the header's block hash for `height`
    Announce { height: u64 },
    Prepare { height: u64, vote: BLSSignature },
    Commit { height: u64, vote: BLSSignature },
    /// Sender asks to leave the header's view for `new_view`
    ///
    /// `prepared` is the highest Prepare certificate the sender holds for
    /// `height`, the block it is locked on.
    ViewChange {
        new_view: u64,
        height: u64,
        prepared: Option<QuorumCertificate>,
        vote: BLSSignature,
    },
    /// Proof that a quorum agreed to enter the certificate's view, plus
    /// the highest Prepare certificate the sender knows of
    NewView {
        certificate: QuorumCertificate,
        prepared: Option<QuorumCertificate>,
    },
}

impl Payload {
    pub fn tag(&self) -> MessageTag {
        match self {
            Payload::Announce { .. } => MessageTag::Announce,
            Payload::Prepare { .. } => MessageTag::Prepare,
            Payload::Commit { .. } => MessageTag::Commit,
            Payload::ViewChange { .. } => MessageTag::ViewChange,
            Payload::NewView { .. } => MessageTag::NewView,
        }
    }

    /// Message type as string (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Announce { .. } => "Announce",
            Payload::Prepare { .. } => "Prepare",
            Payload::Commit { .. } => "Commit",
            Payload::ViewChange { .. } => "ViewChange",
            Payload::NewView { .. } => "NewView",
        }
    }
}

/// Unsigned consensus message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusMessage {
    pub view: u64,
    pub block_hash: Hash,
    pub sender_index: u32,
    pub sender_key: BLSPublicKey,
    pub payload: Payload,
}

/// A vote carried by a message, keyed the way the aggregator counts it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteRef<'a> {
    pub kind: VoteKind,
    pub view: u64,
    pub height: u64,
    pub block_hash: Hash,
    pub signature: &'a BLSSignature,
}

impl ConsensusMessage {
    pub fn tag(&self) -> MessageTag {
        self.payload.tag()
    }

    /// The vote inside this message, if it carries one
    ///
    /// View-change votes count towards the target view and name no block,
    /// so members at different heights aggregate into one certificate.
    pub fn vote(&self) -> Option<VoteRef<'_>> {
        match &self.payload {
            Payload::Prepare { height, vote } => Some(VoteRef {
                kind: VoteKind::Prepare,
                view: self.view,
                height: *height,
                block_hash: self.block_hash,
                signature: vote,
            }),
            Payload::Commit { height, vote } => Some(VoteRef {
                kind: VoteKind::Commit,
                view: self.view,
                height: *height,
                block_hash: self.block_hash,
                signature: vote,
            }),
            Payload::ViewChange { new_view, vote, .. } => Some(VoteRef {
                kind: VoteKind::ViewChange,
                view: *new_view,
                height: 0,
                block_hash: Hash::ZERO,
                signature: vote,
            }),
            Payload::Announce { .. } | Payload::NewView { .. } => None,
        }
    }
}

/// Message plus the sender's signature over its canonical encoding
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedMessage {
    pub message: ConsensusMessage,
    pub signature: BLSSignature,
}
