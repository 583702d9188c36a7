//! Version tags.
//!
//! A version is produced on every successful put: 16 random bytes followed
//! by the unpadded value length as 8 big-endian bytes. Encoding the length
//! lets readers trim shard padding after erasure decoding without a second
//! round-trip.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Number of random identity bytes at the front of a tag.
const IDENTITY_LEN: usize = 16;

/// Total length of an encoded version tag.
pub const VERSION_LEN: usize = IDENTITY_LEN + 8;

/// Generate a fresh version tag encoding the supplied value length.
#[must_use]
pub fn generate(value_len: usize) -> Bytes {
    let mut tag = Vec::with_capacity(VERSION_LEN);
    tag.extend_from_slice(Uuid::new_v4().as_bytes());
    tag.extend_from_slice(&(value_len as u64).to_be_bytes());
    Bytes::from(tag)
}

/// Recover the value length encoded in a version tag.
pub fn decode_size(version: &[u8]) -> Result<usize> {
    if version.len() != VERSION_LEN {
        return Err(Error::internal(format!(
            "malformed version tag of {} bytes",
            version.len()
        )));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&version[IDENTITY_LEN..]);
    Ok(u64::from_be_bytes(len) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_decode_roundtrip() {
        for len in [0usize, 1, 4096, 1024 * 1024] {
            let tag = generate(len);
            assert_eq!(tag.len(), VERSION_LEN);
            assert_eq!(decode_size(&tag).unwrap(), len);
        }
    }

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(generate(10), generate(10));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_size(b"short").is_err());
    }
}
