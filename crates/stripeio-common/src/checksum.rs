//! Blob integrity tags.
//!
//! Every stripe blob travels with a classic CRC32 (IEEE) tag; blobs whose
//! tag does not verify are treated as missing and fall to the erasure
//! decoder.

/// Compute the integrity tag for a blob.
#[inline]
#[must_use]
pub fn compute(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verify a blob against its stored tag.
#[inline]
#[must_use]
pub fn verify(data: &[u8], expected: u32) -> bool {
    crc32fast::hash(data) == expected
}
