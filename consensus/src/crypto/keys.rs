// Key-management collaborator
//
// The consensus core never stores raw key material; it signs through a
// handle supplied at construction.

use super::bls::{BLSPublicKey, BLSSecretKey, BLSSignature};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Signing key unavailable")]
    KeyUnavailable,
    #[error("Signer backend failed: {0}")]
    Backend(String),
}

/// Source of the local node's signatures
pub trait KeyHandle: Send + Sync {
    /// Public half of the signing key
    fn public_key(&self) -> BLSPublicKey;

    /// Sign raw bytes
    fn sign(&self, message: &[u8]) -> Result<BLSSignature, SigningError>;
}

/// In-memory signing key
///
/// blst signing takes `&self` and touches no shared state, so one
/// `LocalKey` can serve concurrent signers. The key can be disabled to
/// model a locked or removed keystore.
pub struct LocalKey {
    secret: BLSSecretKey,
    public: BLSPublicKey,
    enabled: AtomicBool,
}

impl LocalKey {
    pub fn new(secret: BLSSecretKey) -> Self {
        let public = secret.public_key();
        Self {
            secret,
            public,
            enabled: AtomicBool::new(true),
        }
    }

    /// Make subsequent `sign` calls fail (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.enabled.store(available, Ordering::SeqCst);
    }
}

impl KeyHandle for LocalKey {
    fn public_key(&self) -> BLSPublicKey {
        self.public.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<BLSSignature, SigningError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(SigningError::KeyUnavailable);
        }
        Ok(self.secret.sign(message))
    }
}
