pub mod bulk;
pub mod client;
pub mod endpoint;

pub use bulk::{BulkHandle, BulkProxy, BulkRegistry, SinkBuffer};
pub use client::{RpcClient, RpcConnection};
pub use endpoint::Endpoint;

use std::io;
use thiserror::Error;

/// Errors of the RPC transport. Retry policy lives with the request
/// planner, not here; `retryable` only classifies.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timed out")]
    Timeout,

    #[error("peer rejected transfer (errno {0})")]
    Rejected(i32),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl RpcError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout
        )
    }

    /// Errno-compatible code surfaced to callers when the transport itself
    /// failed: EBUSY, counted by the planner's retry budget.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Rejected(errno) => *errno,
            _ => libc::EBUSY,
        }
    }
}
