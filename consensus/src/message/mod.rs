// Consensus messages: types, canonical codec and authentication

pub mod auth;
pub mod codec;
pub mod types;

pub use auth::{AuthError, Authenticator, SealError};
pub use codec::{decode_signed, encode_signed, encode_unsigned, vote_digest, CodecError};
pub use types::{
    CertificateError, ConsensusMessage, MessageTag, Payload, QuorumCertificate, SignedMessage,
    SignerBitmap, VoteKind, VoteRef,
};
