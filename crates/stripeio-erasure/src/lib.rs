//! Reed-Solomon stripe codec
//!
//! Splits a value into `k` equal-sized data shards and computes `m` parity
//! shards. Any `k` surviving shards reconstruct the value. Shards are
//! zero-padded to a common size; the caller trims the decoded value back
//! to its original length (the cluster encodes that length in the version
//! tag).

mod codec;

pub use codec::{ErasureError, StripeCodec};
