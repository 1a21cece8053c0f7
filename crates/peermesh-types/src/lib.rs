//! Core types for the PeerMesh endpoint protocol.
//!
//! This crate defines the value types shared by the protocol layer, the
//! transports and the command-line node: endpoint identity, addressing,
//! protocol versions, subjects, message identity and configuration. It
//! contains no networking logic.

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod message_id;
pub mod subject;
pub mod version;

pub use channel::ChannelTemplate;
pub use endpoint::{DiscoveryInformation, EndpointId, EndpointInformation, ProtocolInformation};
pub use error::{PeerMeshError, PeerMeshResult};
pub use message_id::MessageId;
pub use subject::CommunicationSubject;
pub use version::ProtocolVersion;
