// Message authenticator
//
// Signs outbound messages with the local key and checks inbound ones:
// sender membership, envelope signature, embedded vote signature and
// any certificates the message carries. Verification reads only the roster, so it is
// safe to call from any thread.

use super::codec::{decode_signed, encode_signed, encode_unsigned, vote_digest, CodecError};
use super::types::{CertificateError, ConsensusMessage, Payload, SignedMessage, VoteKind};
use crate::crypto::{BLSPublicKey, BLSSignature, Hash, KeyHandle, SigningError};
use crate::roster::Roster;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] CodecError),
    #[error("Sender is not a committee member")]
    UnknownSender,
    #[error("Sender claims index {claimed} but holds index {actual}")]
    SenderIndexMismatch { claimed: u32, actual: u32 },
    #[error("Invalid message signature")]
    InvalidSignature,
    #[error("Invalid vote signature")]
    InvalidVote,
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(#[from] CertificateError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct Authenticator {
    roster: Arc<Roster>,
    key: Arc<dyn KeyHandle>,
    local_key: BLSPublicKey,
    local_index: u32,
}

impl Authenticator {
    /// Fails with `UnknownSender` if the local key is not in the roster
    pub fn new(roster: Arc<Roster>, key: Arc<dyn KeyHandle>) -> Result<Self, AuthError> {
        let local_key = key.public_key();
        let local_index = roster.index_of(&local_key).ok_or(AuthError::UnknownSender)?;
        Ok(Self {
            roster,
            key,
            local_key,
            local_index,
        })
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn local_key(&self) -> &BLSPublicKey {
        &self.local_key
    }

    /// Swap in the next epoch's committee
    pub fn set_roster(&mut self, roster: Arc<Roster>) -> Result<(), AuthError> {
        self.local_index = roster
            .index_of(&self.local_key)
            .ok_or(AuthError::UnknownSender)?;
        self.roster = roster;
        Ok(())
    }

    /// Build an unsigned message carrying the local sender fields
    pub fn populate(&self, view: u64, block_hash: Hash, payload: Payload) -> ConsensusMessage {
        ConsensusMessage {
            view,
            block_hash,
            sender_index: self.local_index,
            sender_key: self.local_key.clone(),
            payload,
        }
    }

    /// Sign a vote digest with the local key
    pub fn vote(
        &self,
        kind: VoteKind,
        view: u64,
        height: u64,
        block_hash: &Hash,
    ) -> Result<BLSSignature, SigningError> {
        self.key.sign(&vote_digest(kind, view, height, block_hash))
    }

    pub fn sign(&self, message: ConsensusMessage) -> Result<SignedMessage, SealError> {
        let signature = self.key.sign(&encode_unsigned(&message)?)?;
        Ok(SignedMessage { message, signature })
    }

    /// Sign and encode for the wire
    pub fn seal(&self, message: ConsensusMessage) -> Result<Vec<u8>, SealError> {
        Ok(encode_signed(&self.sign(message)?)?)
    }

    pub fn verify(&self, signed: &SignedMessage) -> Result<ConsensusMessage, AuthError> {
        let canonical = encode_unsigned(&signed.message)?;
        self.check(&signed.message, &canonical, &signed.signature)?;
        Ok(signed.message.clone())
    }

    /// Decode wire bytes and verify them
    pub fn open(&self, bytes: &[u8]) -> Result<ConsensusMessage, AuthError> {
        let (signed, canonical) = decode_signed(bytes)?;
        self.check(&signed.message, canonical, &signed.signature)?;
        Ok(signed.message)
    }

    fn check(
        &self,
        message: &ConsensusMessage,
        canonical: &[u8],
        signature: &BLSSignature,
    ) -> Result<(), AuthError> {
        let actual = self
            .roster
            .index_of(&message.sender_key)
            .ok_or(AuthError::UnknownSender)?;
        if actual != message.sender_index {
            return Err(AuthError::SenderIndexMismatch {
                claimed: message.sender_index,
                actual,
            });
        }

        if !signature.verify(canonical, &message.sender_key) {
            return Err(AuthError::InvalidSignature);
        }

        if let Some(vote) = message.vote() {
            let digest = vote_digest(vote.kind, vote.view, vote.height, &vote.block_hash);
            if !vote.signature.verify(&digest, &message.sender_key) {
                return Err(AuthError::InvalidVote);
            }
        }

        match &message.payload {
            Payload::NewView {
                certificate,
                prepared,
            } => {
                certificate.verify_kind(VoteKind::ViewChange, &self.roster)?;
                if let Some(prepared) = prepared {
                    prepared.verify_kind(VoteKind::Prepare, &self.roster)?;
                }
            }
            Payload::ViewChange {
                height,
                prepared: Some(prepared),
                ..
            } => {
                if prepared.height != *height {
                    return Err(CertificateError::HeightMismatch {
                        expected: *height,
                        got: prepared.height,
                    }
                    .into());
                }
                prepared.verify_kind(VoteKind::Prepare, &self.roster)?;
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{aggregate_signatures, hash_data, BLSSecretKey, LocalKey};
    use crate::message::types::{QuorumCertificate, SignerBitmap};
    use crate::roster::{CommitteePolicy, Member};
    use libp2p::identity::Keypair;

    struct Fixture {
        keys: Vec<Arc<LocalKey>>,
        roster: Arc<Roster>,
    }

    fn fixture(n: u8) -> Fixture {
        let keys: Vec<_> = (0..n)
            .map(|i| Arc::new(LocalKey::new(BLSSecretKey::from_seed(&[i + 10; 32]).unwrap())))
            .collect();
        let members = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                Member::new(
                    i as u32,
                    k.public_key(),
                    Keypair::generate_ed25519().public().to_peer_id(),
                )
            })
            .collect();
        let roster = Arc::new(Roster::new(1, members, CommitteePolicy::default()).unwrap());
        Fixture { keys, roster }
    }

    fn auth(f: &Fixture, i: usize) -> Authenticator {
        Authenticator::new(f.roster.clone(), f.keys[i].clone()).unwrap()
    }

    #[test]
    fn test_populate_fills_sender_fields() {
        let f = fixture(4);
        let a = auth(&f, 2);
        let hash = hash_data(b"block");

        let msg = a.populate(2, hash, Payload::Announce { height: 5 });
        assert_eq!(msg.view, 2);
        assert_eq!(msg.block_hash, hash);
        assert_eq!(msg.sender_index, 2);
        assert_eq!(msg.sender_key, f.keys[2].public_key());
    }

    #[test]
    fn test_verify_sign_returns_identical_fields() {
        let f = fixture(4);
        let sender = auth(&f, 1);
        let receiver = auth(&f, 3);
        let hash = hash_data(b"block");

        let vote = sender.vote(VoteKind::Prepare, 1, 1, &hash).unwrap();
        let msg = sender.populate(1, hash, Payload::Prepare { height: 1, vote });
        let signed = sender.sign(msg.clone()).unwrap();

        assert_eq!(receiver.verify(&signed).unwrap(), msg);

        let bytes = sender.seal(msg.clone()).unwrap();
        assert_eq!(receiver.open(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let f = fixture(4);
        let outsider = Arc::new(LocalKey::new(BLSSecretKey::generate()));
        assert_eq!(
            Authenticator::new(f.roster.clone(), outsider.clone()).err(),
            Some(AuthError::UnknownSender)
        );

        // Forge a message from the outsider claiming index 0
        let hash = hash_data(b"block");
        let msg = ConsensusMessage {
            view: 1,
            block_hash: hash,
            sender_index: 0,
            sender_key: outsider.public_key(),
            payload: Payload::Prepare {
                height: 1,
                vote: outsider.sign(&vote_digest(VoteKind::Prepare, 1, 1, &hash)).unwrap(),
            },
        };
        let signature = outsider.sign(&encode_unsigned(&msg).unwrap()).unwrap();
        let signed = SignedMessage {
            message: msg,
            signature,
        };

        assert_eq!(auth(&f, 0).verify(&signed).unwrap_err(), AuthError::UnknownSender);
    }

    #[test]
    fn test_tampered_message_rejected() {
        let f = fixture(4);
        let sender = auth(&f, 1);
        let msg = sender.populate(1, hash_data(b"block"), Payload::Announce { height: 1 });
        let mut signed = sender.sign(msg).unwrap();

        signed.message.view = 2;
        assert_eq!(auth(&f, 0).verify(&signed).unwrap_err(), AuthError::InvalidSignature);
    }

    #[test]
    fn test_index_mismatch_rejected() {
        let f = fixture(4);
        let sender = auth(&f, 1);
        let mut msg = sender.populate(1, hash_data(b"block"), Payload::Announce { height: 1 });
        msg.sender_index = 3;
        let signed = sender.sign(msg).unwrap();

        assert_eq!(
            auth(&f, 0).verify(&signed).unwrap_err(),
            AuthError::SenderIndexMismatch {
                claimed: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn test_vote_over_wrong_block_rejected() {
        let f = fixture(4);
        let sender = auth(&f, 1);
        let vote = sender.vote(VoteKind::Prepare, 1, 1, &hash_data(b"other")).unwrap();
        let msg = sender.populate(1, hash_data(b"block"), Payload::Prepare { height: 1, vote });
        let signed = sender.sign(msg).unwrap();

        assert_eq!(auth(&f, 0).verify(&signed).unwrap_err(), AuthError::InvalidVote);
    }

    #[test]
    fn test_vote_for_other_height_rejected() {
        let f = fixture(4);
        let sender = auth(&f, 1);
        let hash = hash_data(b"block");
        let vote = sender.vote(VoteKind::Commit, 1, 2, &hash).unwrap();
        let msg = sender.populate(1, hash, Payload::Commit { height: 3, vote });
        let signed = sender.sign(msg).unwrap();

        assert_eq!(auth(&f, 0).verify(&signed).unwrap_err(), AuthError::InvalidVote);
    }

    #[test]
    fn test_new_view_certificate_checked() {
        let f = fixture(4);
        let leader = auth(&f, 2);
        let digest = vote_digest(VoteKind::ViewChange, 2, 0, &Hash::ZERO);

        let certificate = |signers: &[u32]| {
            let sigs: Vec<_> = signers
                .iter()
                .map(|i| f.keys[*i as usize].sign(&digest).unwrap())
                .collect();
            QuorumCertificate {
                kind: VoteKind::ViewChange,
                view: 2,
                height: 0,
                block_hash: Hash::ZERO,
                signers: SignerBitmap::from_indices(4, signers.iter().copied()),
                signature: aggregate_signatures(&sigs).unwrap(),
            }
        };

        let good = leader.populate(2, Hash::ZERO, Payload::NewView {
            certificate: certificate(&[0, 1, 2]),
            prepared: None,
        });
        assert!(auth(&f, 0).verify(&leader.sign(good).unwrap()).is_ok());

        let short = leader.populate(2, Hash::ZERO, Payload::NewView {
            certificate: certificate(&[0, 1]),
            prepared: None,
        });
        assert_eq!(
            auth(&f, 0).verify(&leader.sign(short).unwrap()).unwrap_err(),
            AuthError::InvalidCertificate(CertificateError::TooFewSigners { have: 2, need: 3 })
        );

        // Bitmap claims a signer whose signature is missing
        let mut lying = certificate(&[0, 1, 2]);
        lying.signers.set(3);
        let lying = leader.populate(2, Hash::ZERO, Payload::NewView {
            certificate: lying,
            prepared: None,
        });
        assert_eq!(
            auth(&f, 0).verify(&leader.sign(lying).unwrap()).unwrap_err(),
            AuthError::InvalidCertificate(CertificateError::BadSignature)
        );
    }

    fn prepare_certificate(f: &Fixture, view: u64, height: u64, hash: Hash) -> QuorumCertificate {
        let digest = vote_digest(VoteKind::Prepare, view, height, &hash);
        let sigs: Vec<_> = (0..3).map(|i| f.keys[i].sign(&digest).unwrap()).collect();
        QuorumCertificate {
            kind: VoteKind::Prepare,
            view,
            height,
            block_hash: hash,
            signers: SignerBitmap::from_indices(4, 0..3),
            signature: aggregate_signatures(&sigs).unwrap(),
        }
    }

    #[test]
    fn test_view_change_prepared_certificate_checked() {
        let f = fixture(4);
        let sender = auth(&f, 1);
        let locked = hash_data(b"locked");
        let view_change = |height: u64, prepared: QuorumCertificate| {
            let vote = sender.vote(VoteKind::ViewChange, 2, 0, &Hash::ZERO).unwrap();
            let msg = sender.populate(1, Hash::ZERO, Payload::ViewChange {
                new_view: 2,
                height,
                prepared: Some(prepared),
                vote,
            });
            sender.sign(msg).unwrap()
        };

        let good = view_change(4, prepare_certificate(&f, 1, 4, locked));
        assert!(auth(&f, 0).verify(&good).is_ok());

        let stale = view_change(5, prepare_certificate(&f, 1, 4, locked));
        assert_eq!(
            auth(&f, 0).verify(&stale).unwrap_err(),
            AuthError::InvalidCertificate(CertificateError::HeightMismatch {
                expected: 5,
                got: 4
            })
        );

        // Relabelled to a block nobody prepared
        let mut forged = prepare_certificate(&f, 1, 4, locked);
        forged.block_hash = hash_data(b"forged");
        assert_eq!(
            auth(&f, 0).verify(&view_change(4, forged)).unwrap_err(),
            AuthError::InvalidCertificate(CertificateError::BadSignature)
        );

        let mut wrong_kind = prepare_certificate(&f, 1, 4, locked);
        wrong_kind.kind = VoteKind::Commit;
        assert_eq!(
            auth(&f, 0).verify(&view_change(4, wrong_kind)).unwrap_err(),
            AuthError::InvalidCertificate(CertificateError::KindMismatch {
                expected: VoteKind::Prepare,
                got: VoteKind::Commit
            })
        );
    }

    #[test]
    fn test_signing_fails_when_key_unavailable() {
        let f = fixture(4);
        let a = auth(&f, 0);
        f.keys[0].set_available(false);

        let msg = a.populate(1, Hash::ZERO, Payload::Announce { height: 1 });
        assert_eq!(
            a.sign(msg).unwrap_err(),
            SealError::Signing(SigningError::KeyUnavailable)
        );
        assert!(a.vote(VoteKind::Commit, 1, 1, &Hash::ZERO).is_err());
    }
}
