use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

use stripeio_common::{DriveEndpoint, LogType, PersistMode, WriteMode};

/// Status of one drive sub-operation.
///
/// Quorum reduction works on these values; `Ok` is included so results can
/// be counted uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    RemoteNotFound,
    RemoteVersionMismatch,
    RemoteConnectionError,
    ClientIo,
    ClientInternal,
}

/// Error returned by a drive sub-operation.
#[derive(Clone, Debug, Error)]
#[error("{code:?}: {message}")]
pub struct RpcError {
    pub code: StatusCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RemoteNotFound, message)
    }

    pub fn version_mismatch(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RemoteVersionMismatch, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RemoteConnectionError, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ClientIo, message)
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Status of a completed sub-operation result.
#[must_use]
pub fn status_of<T>(result: &RpcResult<T>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::Ok,
        Err(e) => e.code,
    }
}

/// One key's stored record on a drive: value, version tag and integrity tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveRecord {
    pub value: Bytes,
    pub version: Bytes,
    pub tag: u32,
}

/// Limits reported by a single drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriveLimits {
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub max_version_size: usize,
}

/// Capacity reported by a single drive.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DriveCapacity {
    pub nominal_bytes: u64,
    pub portion_full: f64,
}

/// Response of a `GetLog` call; sections are present when requested.
#[derive(Clone, Copy, Debug, Default)]
pub struct DriveLog {
    pub limits: Option<DriveLimits>,
    pub capacity: Option<DriveCapacity>,
}

/// Non-blocking drive session.
///
/// `expected_version` carries the optimistic-concurrency precondition for
/// writes; an empty slice means "no record expected". `persist_mode`
/// selects the durability the drive provides before acknowledging.
#[async_trait]
pub trait DriveClient: Send + Sync {
    async fn get(&self, key: &[u8]) -> RpcResult<DriveRecord>;

    async fn get_version(&self, key: &[u8]) -> RpcResult<Bytes>;

    async fn put(
        &self,
        key: &[u8],
        expected_version: &[u8],
        record: DriveRecord,
        write_mode: WriteMode,
        persist_mode: PersistMode,
    ) -> RpcResult<()>;

    async fn delete(&self, key: &[u8], expected_version: &[u8], mode: WriteMode) -> RpcResult<()>;

    async fn get_key_range(
        &self,
        start: &[u8],
        end: &[u8],
        max_results: usize,
    ) -> RpcResult<Vec<Bytes>>;

    async fn get_log(&self, types: &[LogType]) -> RpcResult<DriveLog>;

    async fn no_op(&self) -> RpcResult<()>;
}

/// Factory establishing drive sessions for one endpoint.
#[async_trait]
pub trait DriveConnector: Send + Sync {
    async fn connect(&self, endpoint: &DriveEndpoint) -> RpcResult<Arc<dyn DriveClient>>;
}
