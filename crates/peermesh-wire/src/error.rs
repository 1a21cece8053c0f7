//! Protocol-layer error types.

use peermesh_types::error::PeerMeshError;
use peermesh_types::{ChannelTemplate, EndpointId};
use std::time::Duration;
use thiserror::Error;

/// Errors from the protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// A contract or configuration error.
    #[error(transparent)]
    PeerMesh(#[from] PeerMeshError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },
    #[error("Unknown frame tag: {0}")]
    UnknownFrame(u8),
    /// The endpoint is neither approved, waiting for approval nor contacted.
    #[error("Endpoint not contactable: {0}")]
    EndpointNotContactable(EndpointId),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Operation cancelled")]
    Cancelled,
    /// The channel host faulted too often. Not recoverable.
    #[error("Maximum number of channel restarts exceeded: {faults} faults within {window:?}")]
    MaximumChannelRestartsExceeded { faults: usize, window: Duration },
    #[error("Unsupported channel template: {0}")]
    UnsupportedChannelTemplate(ChannelTemplate),
    #[error("Channel not open: {0}")]
    ChannelNotOpen(ChannelTemplate),
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Protocol layer is shutting down")]
    ShuttingDown,
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
