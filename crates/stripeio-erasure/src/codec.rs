use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use stripeio_common::Error as CommonError;
use thiserror::Error;

/// Errors specific to erasure coding operations
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("shard size mismatch")]
    ShardSizeMismatch,
}

impl From<ErasureError> for CommonError {
    fn from(e: ErasureError) -> Self {
        CommonError::Internal(e.to_string())
    }
}

/// Minimum shard size in bytes. Keeps shard sizes even (required by the
/// SIMD kernels) and avoids degenerate shards for tiny values.
const MIN_SHARD_SIZE: usize = 64;

/// Stripe codec over `num_data` data shards and `num_parity` parity shards.
#[derive(Debug)]
pub struct StripeCodec {
    num_data: usize,
    num_parity: usize,
}

impl StripeCodec {
    pub fn new(num_data: usize, num_parity: usize) -> Result<Self, ErasureError> {
        if num_data == 0 {
            return Err(ErasureError::InvalidConfig("num_data must be > 0".into()));
        }
        if num_data + num_parity > 255 {
            return Err(ErasureError::InvalidConfig(
                "total shards must be <= 255".into(),
            ));
        }
        Ok(Self {
            num_data,
            num_parity,
        })
    }

    #[must_use]
    pub fn num_data(&self) -> usize {
        self.num_data
    }

    #[must_use]
    pub fn num_parity(&self) -> usize {
        self.num_parity
    }

    #[must_use]
    pub fn total_shards(&self) -> usize {
        self.num_data + self.num_parity
    }

    /// Shard size used for a value of `len` bytes.
    #[must_use]
    pub fn shard_size(&self, len: usize) -> usize {
        let exact = len.div_ceil(self.num_data);
        exact.next_multiple_of(MIN_SHARD_SIZE).max(MIN_SHARD_SIZE)
    }

    /// Encode a value into `num_data + num_parity` equal-sized shards.
    ///
    /// The value is zero-padded; readers truncate to the length encoded in
    /// the stripe's version tag.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        if data.is_empty() {
            return Err(ErasureError::EncodingFailed(
                "cannot encode an empty value".into(),
            ));
        }

        let shard_size = self.shard_size(data.len());
        let mut padded = vec![0u8; shard_size * self.num_data];
        padded[..data.len()].copy_from_slice(data);

        let data_shards: Vec<&[u8]> = padded.chunks(shard_size).collect();

        if self.num_parity == 0 {
            return Ok(data_shards.iter().map(|s| s.to_vec()).collect());
        }

        let mut encoder = ReedSolomonEncoder::new(self.num_data, self.num_parity, shard_size)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        for shard in &data_shards {
            encoder
                .add_original_shard(shard)
                .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
        }
        let result = encoder
            .encode()
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total_shards());
        shards.extend(data_shards.iter().map(|s| s.to_vec()));
        shards.extend(result.recovery_iter().map(|p| p.to_vec()));
        Ok(shards)
    }

    /// Decode shards back to the original value.
    ///
    /// `None` entries mark missing shards; at least `num_data` shards must
    /// survive. The result is truncated to `original_size`.
    pub fn decode(
        &self,
        shards: &[Option<Vec<u8>>],
        original_size: usize,
    ) -> Result<Vec<u8>, ErasureError> {
        if shards.len() != self.total_shards() {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.num_data {
            return Err(ErasureError::InsufficientShards {
                available,
                required: self.num_data,
            });
        }

        let shard_size = shards
            .iter()
            .find_map(|s| s.as_ref().map(Vec::len))
            .ok_or(ErasureError::InsufficientShards {
                available: 0,
                required: self.num_data,
            })?;
        if shards
            .iter()
            .flatten()
            .any(|s| s.len() != shard_size)
        {
            return Err(ErasureError::ShardSizeMismatch);
        }

        // Fast path: all data shards survived.
        if shards[..self.num_data].iter().all(Option::is_some) {
            let mut value = Vec::with_capacity(self.num_data * shard_size);
            for shard in shards.iter().take(self.num_data).flatten() {
                value.extend_from_slice(shard);
            }
            value.truncate(original_size);
            return Ok(value);
        }

        let mut decoder = ReedSolomonDecoder::new(self.num_data, self.num_parity, shard_size)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        for (i, shard) in shards.iter().enumerate().take(self.num_data) {
            if let Some(data) = shard {
                decoder
                    .add_original_shard(i, data)
                    .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
            }
        }
        for (i, shard) in shards.iter().enumerate().skip(self.num_data) {
            if let Some(data) = shard {
                decoder
                    .add_recovery_shard(i - self.num_data, data)
                    .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
            }
        }
        let restored = decoder
            .decode()
            .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;

        let mut value = Vec::with_capacity(self.num_data * shard_size);
        for (i, shard) in shards.iter().enumerate().take(self.num_data) {
            if let Some(data) = shard {
                value.extend_from_slice(data);
            } else if let Some(data) = restored.restored_original(i) {
                value.extend_from_slice(data);
            } else {
                return Err(ErasureError::DecodingFailed(format!(
                    "failed to restore data shard {i}"
                )));
            }
        }
        value.truncate(original_size);
        Ok(value)
    }
}
