//! Shared error types for PeerMesh.

use thiserror::Error;

/// Contract and configuration errors.
///
/// These are raised immediately and are never retried: a malformed endpoint
/// id or an invalid channel type is a caller mistake, not a transient fault.
#[derive(Error, Debug)]
pub enum PeerMeshError {
    /// The string could not be parsed as an endpoint id.
    #[error("Invalid endpoint id: {0}")]
    InvalidEndpointId(String),

    /// A channel template that cannot carry traffic (e.g. `None`).
    #[error("Invalid channel template: {0}")]
    InvalidChannelTemplate(String),

    /// The string could not be parsed as a protocol version.
    #[error("Invalid protocol version: {0}")]
    InvalidProtocolVersion(String),

    /// A configuration value was present but unusable.
    #[error("Configuration error for '{key}': {reason}")]
    Config {
        /// The configuration key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with PeerMeshError.
pub type PeerMeshResult<T> = Result<T, PeerMeshError>;
