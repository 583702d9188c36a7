//! Drive RPC surface
//!
//! The engine consumes drives through the [`DriveClient`] trait; the
//! concrete wire protocol stays behind it. Any implementation offering
//! these primitives and status codes is a drop-in replacement. The
//! [`sim`] module provides the in-memory drive used by the test suites.

mod client;
pub mod sim;

pub use client::{
    status_of, DriveCapacity, DriveClient, DriveConnector, DriveLimits, DriveLog, DriveRecord,
    RpcError, RpcResult, StatusCode,
};
