// Cryptography for the FBFT consensus core
//
// - BLS signatures with order-independent aggregation
// - Block hashes (BLAKE3 / SHA-256)
// - The signing-key handle supplied by key management

pub mod bls;
pub mod hash;
pub mod keys;

pub use bls::{
    aggregate_public_keys, aggregate_signatures, verify_aggregate, BLSError, BLSPublicKey,
    BLSSecretKey, BLSSignature, BLS_PUBLIC_KEY_SIZE, BLS_SIGNATURE_SIZE,
};
pub use hash::{hash_data, hash_data_with, Hash, HashFunction, HASH_SIZE};
pub use keys::{KeyHandle, LocalKey, SigningError};
