//! PeerMesh wire protocol: endpoint discovery, handshake and messaging.
//!
//! A node embeds a [`ProtocolLayer`]. The layer opens one listening
//! channel per allowed transport, learns about other endpoints from its
//! discovery sources, negotiates a connection with each of them, and then
//! lets the application exchange messages and data streams with every
//! connected endpoint.
//!
//! ## Architecture
//!
//! - **ProtocolLayer**: Facade that signs the node in and out and sends on its behalf
//! - **EndpointDirectory**: Tracks contacted and connected endpoints
//! - **HandshakeConductor**: Negotiates connections in both directions
//! - **ProtocolChannel**: Listening hosts and cached senders for one transport
//! - **MessageHandler / DataHandler**: Correlate replies and dispatch inbound traffic
//! - **ConnectionMonitor**: Keep-alive checks of idle connections
//! - **DiscoverySource**: Pluggable producers of available/unavailable events
//!
//! Frames on the wire are `[tag:u8][len:u32 BE][JSON]`; data frames append
//! `[len:u64 BE][payload]`.

pub mod data;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod host;
pub mod layer;
pub mod message;
pub mod messenger;
pub mod monitor;
pub mod pending;
pub mod protocol_channel;
pub mod transport;

pub use directory::{DirectoryEvent, EndpointDirectory};
pub use discovery::{DiscoveredEndpoint, DiscoveryEvent, DiscoverySource};
pub use error::{WireError, WireResult};
pub use handshake::{ApproveEndpointConnections, HandshakeConductor};
pub use layer::{LayerState, ProtocolEvent, ProtocolLayer, ProtocolLayerBuilder, UploadSource};
pub use message::{MessageKind, MessageType, ProtocolMessage, PROTOCOL_VERSION};
pub use messenger::ProtocolMessenger;
