//! Binary encoding of disk tier blobs
//!
//! The default [`EnvelopeCodec`] frames a payload as:
//!
//! ```text
//! magic "LXCB" | version u8 | key_len u32 LE | key |
//!     payload_len u64 LE | payload | sha256(payload)
//! ```
//!
//! Embedding the key lets a read reject a blob that belongs to another key,
//! and the trailing digest rejects torn or bit-rotted files.

use crate::error::{CacheError, Result};
use sha2::{Digest, Sha256};

const MAGIC: &[u8; 4] = b"LXCB";
const VERSION: u8 = 1;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// Pluggable blob format for the disk tier
pub trait BlobCodec: Send + Sync {
    /// Frame `value` for storage under `key`
    fn encode(&self, key: &str, value: &[u8]) -> Result<Vec<u8>>;

    /// Recover the payload, failing if the blob is not a valid frame for `key`
    fn decode(&self, key: &str, blob: &[u8]) -> Result<Vec<u8>>;
}

/// Length-prefixed, checksummed envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl BlobCodec for EnvelopeCodec {
    fn encode(&self, key: &str, value: &[u8]) -> Result<Vec<u8>> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| {
                CacheError::Serialization(format!("key of {} bytes too long", key.len()))
            })?;

        let mut out =
            Vec::with_capacity(HEADER_LEN + key.len() + 8 + value.len() + DIGEST_LEN);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&key_len.to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u64).to_le_bytes());
        out.extend_from_slice(value);
        out.extend_from_slice(&Sha256::digest(value));
        Ok(out)
    }

    fn decode(&self, key: &str, blob: &[u8]) -> Result<Vec<u8>> {
        let mut reader = Reader { buf: blob, pos: 0 };

        if reader.take(MAGIC.len())? != MAGIC {
            return Err(CacheError::Serialization("bad blob magic".to_string()));
        }
        let version = reader.take(1)?[0];
        if version != VERSION {
            return Err(CacheError::Serialization(format!(
                "unsupported blob version {}",
                version
            )));
        }

        let key_len = u32::from_le_bytes(reader.array()?) as usize;
        let stored_key = reader.take(key_len)?;
        if stored_key != key.as_bytes() {
            return Err(CacheError::Serialization(format!(
                "blob belongs to a different key than {}",
                key
            )));
        }

        let payload_len = usize::try_from(u64::from_le_bytes(reader.array()?))
            .map_err(|_| CacheError::Serialization("payload length overflow".to_string()))?;
        let payload = reader.take(payload_len)?;
        let digest = reader.take(DIGEST_LEN)?;

        if reader.pos != blob.len() {
            return Err(CacheError::Serialization(format!(
                "{} trailing bytes after blob",
                blob.len() - reader.pos
            )));
        }
        if Sha256::digest(payload).as_slice() != digest {
            return Err(CacheError::Serialization("blob checksum mismatch".to_string()));
        }

        Ok(payload.to_vec())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| CacheError::Serialization("truncated blob".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Hex SHA-256 of a key, used as its blob file stem
pub fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
