//! `peermesh run`: sign a node in and report what happens to it.

use crate::cli::RunArgs;
use anyhow::Context;
use chrono::Local;
use peermesh_types::config::ProtocolConfig;
use peermesh_types::CommunicationSubject;
use peermesh_wire::discovery::{
    DiscoveredEndpoint, ManualDiscoverySource, UdpDiscoveryConfig, UdpDiscoverySource,
};
use peermesh_wire::transport::tcp::TcpTransport;
use peermesh_wire::{ProtocolEvent, ProtocolLayer};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Read a contact file written by another node's `--announce-file`.
pub fn read_contact_file(path: &Path) -> anyhow::Result<DiscoveredEndpoint> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn write_contact_file(path: &Path, endpoint: &DiscoveredEndpoint) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(endpoint)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

/// One line per event, prefixed with the local time.
pub fn format_event(event: &ProtocolEvent) -> String {
    let now = Local::now().format("%H:%M:%S");
    match event {
        ProtocolEvent::SignedIn => format!("[{now}] signed in"),
        ProtocolEvent::SignedOut => format!("[{now}] signed out"),
        ProtocolEvent::EndpointConnected(info) => format!(
            "[{now}] connected    {} via {}",
            info.id, info.protocol.message_address
        ),
        ProtocolEvent::EndpointDisconnected(id) => format!("[{now}] disconnected {id}"),
        ProtocolEvent::ChannelFailed { template, reason } => {
            format!("[{now}] channel {template} failed: {reason}")
        }
    }
}

fn build_layer(
    config: &ProtocolConfig,
    args: &RunArgs,
    manual: Arc<ManualDiscoverySource>,
) -> anyhow::Result<ProtocolLayer> {
    let mut builder = ProtocolLayer::builder(config.clone())
        .subjects(args.subjects.iter().map(CommunicationSubject::new))
        .transport(Arc::new(TcpTransport::from_config(config)))
        .discovery_source(manual);

    if args.pipe {
        #[cfg(unix)]
        {
            use peermesh_wire::transport::pipe::PipeTransport;
            builder = builder.transport(Arc::new(PipeTransport::from_config(config)));
        }
        #[cfg(not(unix))]
        warn!("Named-pipe channels are only available on Unix");
    }
    if args.udp {
        builder = builder.discovery_source(Arc::new(UdpDiscoverySource::new(
            UdpDiscoveryConfig::from_config(config),
        )));
    }
    Ok(builder.build()?)
}

/// Run a node until Ctrl+C or until one of its channels fails for good.
pub async fn run(config: ProtocolConfig, args: RunArgs) -> anyhow::Result<()> {
    let manual = Arc::new(ManualDiscoverySource::new());
    let layer = build_layer(&config, &args, Arc::clone(&manual))?;
    let mut events = layer.events();

    layer.sign_in().await?;
    let local = layer.local_endpoint();
    println!("PeerMesh node {}", layer.id());
    for protocol in &local.protocols {
        println!("  listening on {}", protocol.message_address);
    }
    println!("  subjects:    {}", args.subjects.join(", "));

    if let Some(path) = &args.announce_file {
        write_contact_file(path, &local)?;
        info!(path = %path.display(), "Contact file written");
    }
    for peer in &args.peers {
        match read_contact_file(peer) {
            Ok(endpoint) => manual.announce_available(endpoint),
            Err(e) => warn!(path = %peer.display(), error = %e, "Skipping peer"),
        }
    }

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", format_event(&event));
                    if let ProtocolEvent::ChannelFailed { template, reason } = event {
                        break Err(anyhow::anyhow!("channel {template} failed: {reason}"));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    layer.sign_out().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use peermesh_types::{DiscoveryInformation, EndpointId, ProtocolInformation};
    use peermesh_wire::PROTOCOL_VERSION;

    #[test]
    fn test_contact_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let endpoint = DiscoveredEndpoint {
            id: EndpointId::new("alpha", 12),
            discovery: DiscoveryInformation::new(
                PROTOCOL_VERSION,
                "net.tcp://alpha:4000/discovery".parse().unwrap(),
            ),
            protocols: vec![ProtocolInformation::new(
                PROTOCOL_VERSION,
                "net.tcp://alpha:4000/protocol/messages/a".parse().unwrap(),
                Some("net.tcp://alpha:4001/protocol/data/b".parse().unwrap()),
            )],
        };

        write_contact_file(&path, &endpoint).unwrap();
        assert_eq!(read_contact_file(&path).unwrap(), endpoint);
    }

    #[test]
    fn test_bad_contact_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(read_contact_file(&path).is_err());
        assert!(read_contact_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_format_failure_event() {
        let line = format_event(&ProtocolEvent::ChannelFailed {
            template: peermesh_types::ChannelTemplate::TcpIP,
            reason: "too many restarts".to_string(),
        });
        assert!(line.ends_with("channel tcp_ip failed: too many restarts"));
    }
}
