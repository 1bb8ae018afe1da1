// Canonical wire encoding
//
// Layout (all integers big-endian):
//   tag u8 | view u64 | block hash [32] | sender key [48] | sender index u32
//   | payload | signature [96]
// The signature covers every byte before it and is never part of the
// signed digest. Payloads:
//   Announce   height u64
//   Prepare    height u64 | vote [96]
//   Commit     height u64 | vote [96]
//   ViewChange new_view u64 | height u64 | prepared? | vote [96]
//   NewView    view u64 | bitmap len u16 | bitmap | aggregate [96] | prepared?
// prepared? is a u8 flag, 0 for absent or 1 followed by a Prepare
// certificate:
//   view u64 | height u64 | block hash [32] | bitmap len u16 | bitmap | aggregate [96]

use super::types::{
    ConsensusMessage, MessageTag, Payload, QuorumCertificate, SignedMessage, SignerBitmap,
    VoteKind,
};
use crate::crypto::{BLSPublicKey, BLSSignature, Hash, BLS_PUBLIC_KEY_SIZE, BLS_SIGNATURE_SIZE, HASH_SIZE};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message truncated: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("Unknown message tag {0}")]
    UnknownTag(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("Invalid sender public key")]
    InvalidKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Signer bitmap of {0} bytes is too large")]
    BitmapTooLarge(usize),
    #[error("Invalid presence flag {0}")]
    InvalidFlag(u8),
}

/// Bytes a vote signature covers: tag | view | height | block hash
pub fn vote_digest(kind: VoteKind, view: u64, height: u64, block_hash: &Hash) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + 8 + 8 + HASH_SIZE);
    data.push(kind.tag() as u8);
    data.extend_from_slice(&view.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(block_hash.as_bytes());
    data
}

/// Canonical encoding of the unsigned fields; this is what gets signed
pub fn encode_unsigned(message: &ConsensusMessage) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::with_capacity(1 + 8 + HASH_SIZE + BLS_PUBLIC_KEY_SIZE + 4 + 256);
    data.push(message.tag() as u8);
    data.extend_from_slice(&message.view.to_be_bytes());
    data.extend_from_slice(message.block_hash.as_bytes());
    data.extend_from_slice(&message.sender_key.to_bytes());
    data.extend_from_slice(&message.sender_index.to_be_bytes());

    match &message.payload {
        Payload::Announce { height } => data.extend_from_slice(&height.to_be_bytes()),
        Payload::Prepare { height, vote } | Payload::Commit { height, vote } => {
            data.extend_from_slice(&height.to_be_bytes());
            data.extend_from_slice(&vote.to_bytes());
        }
        Payload::ViewChange {
            new_view,
            height,
            prepared,
            vote,
        } => {
            data.extend_from_slice(&new_view.to_be_bytes());
            data.extend_from_slice(&height.to_be_bytes());
            put_prepared(&mut data, prepared.as_ref())?;
            data.extend_from_slice(&vote.to_bytes());
        }
        Payload::NewView {
            certificate,
            prepared,
        } => {
            data.extend_from_slice(&certificate.view.to_be_bytes());
            put_signers(&mut data, certificate)?;
            put_prepared(&mut data, prepared.as_ref())?;
        }
    }

    Ok(data)
}

fn put_signers(data: &mut Vec<u8>, certificate: &QuorumCertificate) -> Result<(), CodecError> {
    let bitmap = certificate.signers.as_bytes();
    let len = u16::try_from(bitmap.len()).map_err(|_| CodecError::BitmapTooLarge(bitmap.len()))?;
    data.extend_from_slice(&len.to_be_bytes());
    data.extend_from_slice(bitmap);
    data.extend_from_slice(&certificate.signature.to_bytes());
    Ok(())
}

fn put_prepared(data: &mut Vec<u8>, prepared: Option<&QuorumCertificate>) -> Result<(), CodecError> {
    let Some(certificate) = prepared else {
        data.push(0);
        return Ok(());
    };
    data.push(1);
    data.extend_from_slice(&certificate.view.to_be_bytes());
    data.extend_from_slice(&certificate.height.to_be_bytes());
    data.extend_from_slice(certificate.block_hash.as_bytes());
    put_signers(data, certificate)
}

/// Wire bytes: canonical encoding followed by the envelope signature
pub fn encode_signed(signed: &SignedMessage) -> Result<Vec<u8>, CodecError> {
    let mut data = encode_unsigned(&signed.message)?;
    data.extend_from_slice(&signed.signature.to_bytes());
    Ok(data)
}

/// Parse wire bytes; returns the message and the exact bytes its signature covers
pub fn decode_signed(bytes: &[u8]) -> Result<(SignedMessage, &[u8]), CodecError> {
    let mut reader = Reader::new(bytes);

    let raw_tag = reader.u8()?;
    let tag = MessageTag::from_u8(raw_tag).ok_or(CodecError::UnknownTag(raw_tag))?;
    let view = reader.u64()?;
    let block_hash = reader.hash()?;
    let sender_key = reader.public_key()?;
    let sender_index = reader.u32()?;

    let payload = match tag {
        MessageTag::Announce => Payload::Announce {
            height: reader.u64()?,
        },
        MessageTag::Prepare => Payload::Prepare {
            height: reader.u64()?,
            vote: reader.signature()?,
        },
        MessageTag::Commit => Payload::Commit {
            height: reader.u64()?,
            vote: reader.signature()?,
        },
        MessageTag::ViewChange => Payload::ViewChange {
            new_view: reader.u64()?,
            height: reader.u64()?,
            prepared: reader.prepared()?,
            vote: reader.signature()?,
        },
        MessageTag::NewView => {
            let certified_view = reader.u64()?;
            let (signers, signature) = reader.signers()?;
            Payload::NewView {
                certificate: QuorumCertificate {
                    kind: VoteKind::ViewChange,
                    view: certified_view,
                    height: 0,
                    block_hash: Hash::ZERO,
                    signers,
                    signature,
                },
                prepared: reader.prepared()?,
            }
        }
    };

    let signed_len = reader.position();
    let signature = reader.signature()?;
    if reader.remaining() > 0 {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }

    let message = ConsensusMessage {
        view,
        block_hash,
        sender_index,
        sender_key,
        payload,
    };
    Ok((SignedMessage { message, signature }, &bytes[..signed_len]))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn hash(&mut self) -> Result<Hash, CodecError> {
        Ok(Hash::new(self.array()?))
    }

    fn public_key(&mut self) -> Result<BLSPublicKey, CodecError> {
        BLSPublicKey::from_bytes(self.take(BLS_PUBLIC_KEY_SIZE)?).map_err(|_| CodecError::InvalidKey)
    }

    fn signature(&mut self) -> Result<BLSSignature, CodecError> {
        BLSSignature::from_bytes(self.take(BLS_SIGNATURE_SIZE)?)
            .map_err(|_| CodecError::InvalidSignature)
    }

    fn signers(&mut self) -> Result<(SignerBitmap, BLSSignature), CodecError> {
        let len = self.u16()? as usize;
        let bitmap = SignerBitmap::from_bytes(self.take(len)?.to_vec());
        Ok((bitmap, self.signature()?))
    }

    fn prepared(&mut self) -> Result<Option<QuorumCertificate>, CodecError> {
        match self.u8()? {
            0 => Ok(None),
            1 => {
                let view = self.u64()?;
                let height = self.u64()?;
                let block_hash = self.hash()?;
                let (signers, signature) = self.signers()?;
                Ok(Some(QuorumCertificate {
                    kind: VoteKind::Prepare,
                    view,
                    height,
                    block_hash,
                    signers,
                    signature,
                }))
            }
            flag => Err(CodecError::InvalidFlag(flag)),
        }
    }
}
