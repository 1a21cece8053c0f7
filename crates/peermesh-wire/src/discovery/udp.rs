//! UDP broadcast discovery.
//!
//! Every node periodically broadcasts a JSON announcement describing
//! itself and listens for the announcements of others. An endpoint that is
//! not heard from for [`EXPIRY_FACTOR`] announce intervals is reported
//! unavailable. A node that stops sends a final "leaving" datagram.

use super::{DiscoveredEndpoint, DiscoveryEvent, DiscoverySource};
use crate::error::WireResult;
use async_trait::async_trait;
use peermesh_types::config::ProtocolConfig;
use peermesh_types::EndpointId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Missed announce intervals after which an endpoint expires.
pub const EXPIRY_FACTOR: u32 = 3;

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Announcement {
    Present { endpoint: DiscoveredEndpoint },
    Leaving { id: EndpointId },
}

/// Where to listen and where to announce.
#[derive(Debug, Clone)]
pub struct UdpDiscoveryConfig {
    pub bind: SocketAddr,
    pub targets: Vec<SocketAddr>,
    pub announce_interval: Duration,
}

impl UdpDiscoveryConfig {
    /// Broadcast on the local network on the configured port.
    pub fn from_config(config: &ProtocolConfig) -> Self {
        let port = config.discovery_udp_port;
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            targets: vec![SocketAddr::from((Ipv4Addr::BROADCAST, port))],
            announce_interval: config.discovery_announce_interval,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Discovery over UDP broadcast.
pub struct UdpDiscoverySource {
    config: UdpDiscoveryConfig,
    running: Mutex<Option<Running>>,
}

impl UdpDiscoverySource {
    pub fn new(config: UdpDiscoveryConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DiscoverySource for UdpDiscoverySource {
    fn name(&self) -> &str {
        "udp"
    }

    async fn start(
        &self,
        local: watch::Receiver<DiscoveredEndpoint>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> WireResult<()> {
        if self.running.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind(self.config.bind).await?;
        socket.set_broadcast(true)?;
        info!(bind = %socket.local_addr()?, "UDP discovery started");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            socket,
            self.config.clone(),
            local,
            events,
            cancel.clone(),
        ));
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(Running { cancel, task });
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.task.await;
            debug!("UDP discovery stopped");
        }
    }
}

async fn announce(socket: &UdpSocket, targets: &[SocketAddr], announcement: &Announcement) {
    let bytes = match serde_json::to_vec(announcement) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Cannot encode announcement");
            return;
        }
    };
    for target in targets {
        if let Err(e) = socket.send_to(&bytes, target).await {
            debug!(target = %target, error = %e, "Announcement not sent");
        }
    }
}

async fn run(
    socket: UdpSocket,
    config: UdpDiscoveryConfig,
    local: watch::Receiver<DiscoveredEndpoint>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    let expiry = config.announce_interval * EXPIRY_FACTOR;
    let mut seen: HashMap<EndpointId, (DiscoveredEndpoint, Instant)> = HashMap::new();
    let mut ticker = tokio::time::interval(config.announce_interval);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let me = local.borrow().clone();
                announce(&socket, &config.targets, &Announcement::Present { endpoint: me }).await;

                let now = Instant::now();
                let expired: Vec<EndpointId> = seen
                    .iter()
                    .filter(|(_, (_, last))| now.duration_since(*last) > expiry)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    seen.remove(&id);
                    info!(endpoint = %id, "Endpoint expired");
                    let _ = events.send(DiscoveryEvent::Unavailable(id));
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, "Discovery receive failed");
                        continue;
                    }
                };
                let announcement: Announcement = match serde_json::from_slice(&buf[..len]) {
                    Ok(announcement) => announcement,
                    Err(e) => {
                        debug!(from = %from, error = %e, "Ignoring malformed announcement");
                        continue;
                    }
                };
                let local_id = local.borrow().id.clone();
                match announcement {
                    Announcement::Present { endpoint } if endpoint.id != local_id => {
                        let changed = seen
                            .get(&endpoint.id)
                            .map(|(known, _)| *known != endpoint)
                            .unwrap_or(true);
                        seen.insert(endpoint.id.clone(), (endpoint.clone(), Instant::now()));
                        if changed {
                            debug!(endpoint = %endpoint.id, from = %from, "Endpoint announced");
                            let _ = events.send(DiscoveryEvent::Available(endpoint));
                        }
                    }
                    Announcement::Leaving { id } if id != local_id => {
                        if seen.remove(&id).is_some() {
                            info!(endpoint = %id, "Endpoint left");
                            let _ = events.send(DiscoveryEvent::Unavailable(id));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let id = local.borrow().id.clone();
    announce(&socket, &config.targets, &Announcement::Leaving { id }).await;
}
