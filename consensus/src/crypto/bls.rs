// BLS signatures over BLS12-381
//
// Committee members sign with min-pk keys:
// - public keys in G1 (48 bytes compressed)
// - signatures in G2 (96 bytes compressed)
// Signatures over the same message aggregate by point addition, so the
// combined signature does not depend on the order partials arrive in.

use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey as BlstPublicKey,
    SecretKey as BlstSecretKey, Signature as BlstSignature,
};
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use thiserror::Error;

pub const BLS_SIGNATURE_SIZE: usize = 96;
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
pub const BLS_SECRET_KEY_SIZE: usize = 32;

/// Ciphersuite domain separation tag (basic scheme, G2 signatures)
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BLSError {
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Nothing to aggregate")]
    EmptyAggregate,
    #[error("Seed must be at least 32 bytes, got {0}")]
    ShortSeed(usize),
}

/// BLS secret key wrapper
#[derive(Clone)]
pub struct BLSSecretKey {
    inner: BlstSecretKey,
}

impl BLSSecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut ikm);
        // 32 bytes of key material always satisfies key_gen
        Self::from_seed(&ikm).unwrap_or_else(|_| unreachable!("32-byte seed"))
    }

    /// Derive a key deterministically from at least 32 bytes of key material
    pub fn from_seed(ikm: &[u8]) -> Result<Self, BLSError> {
        if ikm.len() < 32 {
            return Err(BLSError::ShortSeed(ikm.len()));
        }
        let inner = BlstSecretKey::key_gen(ikm, &[]).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSecretKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> BLSPublicKey {
        BLSPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> BLSSignature {
        BLSSignature {
            inner: self.inner.sign(message, BLS_DST, &[]),
        }
    }
}

impl fmt::Debug for BLSSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BLSSecretKey(..)")
    }
}

/// BLS public key wrapper
#[derive(Clone, PartialEq, Eq)]
pub struct BLSPublicKey {
    inner: BlstPublicKey,
}

impl BLSPublicKey {
    /// Create from compressed bytes, validating the point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        if bytes.len() != BLS_PUBLIC_KEY_SIZE {
            return Err(BLSError::InvalidKey);
        }
        let inner = BlstPublicKey::key_validate(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Serialize to compressed bytes
    pub fn to_bytes(&self) -> [u8; BLS_PUBLIC_KEY_SIZE] {
        self.inner.compress()
    }
}

impl StdHash for BLSPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Debug for BLSPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLSPublicKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// BLS signature wrapper (constant 96 bytes)
#[derive(Clone, PartialEq, Eq)]
pub struct BLSSignature {
    inner: BlstSignature,
}

impl BLSSignature {
    /// Create from compressed bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        if bytes.len() != BLS_SIGNATURE_SIZE {
            return Err(BLSError::InvalidSignature);
        }
        let inner = BlstSignature::from_bytes(bytes).map_err(|_| BLSError::InvalidSignature)?;
        Ok(Self { inner })
    }

    /// Serialize to compressed bytes
    pub fn to_bytes(&self) -> [u8; BLS_SIGNATURE_SIZE] {
        self.inner.compress()
    }

    /// Verify this signature over `message` against a single public key
    pub fn verify(&self, message: &[u8], public_key: &BLSPublicKey) -> bool {
        let result = self
            .inner
            .verify(true, message, BLS_DST, &[], &public_key.inner, true);
        result == blst::BLST_ERROR::BLST_SUCCESS
    }
}

impl fmt::Debug for BLSSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLSSignature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// Combine signatures over the same message into one aggregate signature
pub fn aggregate_signatures<'a, I>(signatures: I) -> Result<BLSSignature, BLSError>
where
    I: IntoIterator<Item = &'a BLSSignature>,
{
    let sigs: Vec<&BlstSignature> = signatures.into_iter().map(|s| &s.inner).collect();
    if sigs.is_empty() {
        return Err(BLSError::EmptyAggregate);
    }

    let combined = AggregateSignature::aggregate(&sigs, false)
        .map_err(|_| BLSError::InvalidSignature)?
        .to_signature();

    Ok(BLSSignature { inner: combined })
}

/// Combine public keys into the key an aggregate signature verifies against
pub fn aggregate_public_keys<'a, I>(public_keys: I) -> Result<BLSPublicKey, BLSError>
where
    I: IntoIterator<Item = &'a BLSPublicKey>,
{
    let pks: Vec<&BlstPublicKey> = public_keys.into_iter().map(|pk| &pk.inner).collect();
    if pks.is_empty() {
        return Err(BLSError::EmptyAggregate);
    }

    let combined = AggregatePublicKey::aggregate(&pks, false)
        .map_err(|_| BLSError::InvalidKey)?
        .to_public_key();

    Ok(BLSPublicKey { inner: combined })
}

/// Verify an aggregate signature over `message` signed by every key in `public_keys`
pub fn verify_aggregate(
    message: &[u8],
    signature: &BLSSignature,
    public_keys: &[BLSPublicKey],
) -> Result<bool, BLSError> {
    let aggregated = aggregate_public_keys(public_keys)?;
    Ok(signature.verify(message, &aggregated))
}
