//! Discovery driven by the application: endpoints are announced by hand.

use super::{DiscoveredEndpoint, DiscoveryEvent, DiscoverySource};
use crate::error::WireResult;
use async_trait::async_trait;
use peermesh_types::EndpointId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// A source that reports exactly what it is told.
///
/// Endpoints announced before the source starts are replayed on start.
#[derive(Default)]
pub struct ManualDiscoverySource {
    known: Mutex<HashMap<EndpointId, DiscoveredEndpoint>>,
    events: Mutex<Option<mpsc::UnboundedSender<DiscoveryEvent>>>,
}

impl ManualDiscoverySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an endpoint as available.
    pub fn announce_available(&self, endpoint: DiscoveredEndpoint) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.id.clone(), endpoint.clone());
        self.emit(DiscoveryEvent::Available(endpoint));
    }

    /// Report an endpoint as gone.
    pub fn announce_unavailable(&self, id: &EndpointId) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        self.emit(DiscoveryEvent::Unavailable(id.clone()));
    }

    fn emit(&self, event: DiscoveryEvent) {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl DiscoverySource for ManualDiscoverySource {
    fn name(&self) -> &str {
        "manual"
    }

    async fn start(
        &self,
        _local: watch::Receiver<DiscoveredEndpoint>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> WireResult<()> {
        let known: Vec<DiscoveredEndpoint> = self
            .known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        debug!(replayed = known.len(), "Manual discovery started");
        for endpoint in known {
            let _ = events.send(DiscoveryEvent::Available(endpoint));
        }
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(events);
        Ok(())
    }

    async fn stop(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
