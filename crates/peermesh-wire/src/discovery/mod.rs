//! Discovery sources: producers of "endpoint available/unavailable" events.
//!
//! A source is started with a view of the local endpoint (so it can
//! announce it) and a channel to report what it finds. The protocol layer
//! turns [`DiscoveryEvent::Available`] into a handshake and
//! [`DiscoveryEvent::Unavailable`] into a directory removal.

pub mod manual;
pub mod udp;

pub use manual::ManualDiscoverySource;
pub use udp::{UdpDiscoveryConfig, UdpDiscoverySource};

use crate::error::WireResult;
use async_trait::async_trait;
use peermesh_types::{DiscoveryInformation, EndpointId, ProtocolInformation};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

/// An endpoint as seen by discovery: where to find it and which protocols
/// it offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    pub id: EndpointId,
    pub discovery: DiscoveryInformation,
    pub protocols: Vec<ProtocolInformation>,
}

/// What a discovery source reports.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Available(DiscoveredEndpoint),
    Unavailable(EndpointId),
}

/// A pluggable discovery mechanism.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Start reporting endpoints on `events`. `local` always holds the
    /// current description of this endpoint.
    async fn start(
        &self,
        local: watch::Receiver<DiscoveredEndpoint>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> WireResult<()>;

    /// Stop reporting. Stopping a stopped source is a no-op.
    async fn stop(&self);
}
