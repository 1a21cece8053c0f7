//! TCP channels (`net.tcp://host:port/path`).

use super::{
    serve_connection, ChannelPurpose, ChannelTransport, FrameLimits, FrameSender, HostEvent,
    InboundSink, ListenerHandle, StreamSender,
};
use crate::error::{WireError, WireResult};
use async_trait::async_trait;
use peermesh_types::config::ProtocolConfig;
use peermesh_types::ChannelTemplate;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Settings for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpSettings {
    /// Host name or IP put into generated addresses.
    pub base_address: String,
    /// Fixed message port. Data uses the next port. `None` picks free ports.
    pub port: Option<u16>,
    pub discovery_path: String,
    pub protocol_path: String,
}

impl TcpSettings {
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self {
            base_address: config.tcp_base_address.clone(),
            port: config.tcp_port,
            discovery_path: config.tcp_discovery_path.clone(),
            protocol_path: config.tcp_protocol_path.clone(),
        }
    }
}

/// TCP implementation of [`ChannelTransport`].
pub struct TcpTransport {
    settings: TcpSettings,
    limits: FrameLimits,
}

impl TcpTransport {
    pub fn new(settings: TcpSettings, limits: FrameLimits) -> Self {
        Self { settings, limits }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(TcpSettings::from_config(config), FrameLimits::from_config(config))
    }

    fn port_for(&self, purpose: ChannelPurpose) -> u16 {
        match (self.settings.port, purpose) {
            (Some(port), ChannelPurpose::Messages) => port,
            (Some(port), ChannelPurpose::Data) => port.wrapping_add(1),
            (None, _) => 0,
        }
    }
}

fn invalid(address: &Url, reason: &str) -> WireError {
    WireError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

/// The socket address to bind for `address`: its host if that is an IP,
/// every interface otherwise.
fn bind_address(address: &Url) -> WireResult<SocketAddr> {
    let port = address.port().ok_or_else(|| invalid(address, "missing port"))?;
    let ip = address
        .host_str()
        .and_then(|h| h.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    Ok(SocketAddr::new(ip, port))
}

#[async_trait]
impl ChannelTransport for TcpTransport {
    fn template(&self) -> ChannelTemplate {
        ChannelTemplate::TcpIP
    }

    fn generate_new_channel_uri(&self, purpose: ChannelPurpose) -> WireResult<Url> {
        let raw = format!(
            "{}://{}:{}/{}/{}/{}",
            ChannelTemplate::TcpIP.scheme().unwrap_or("net.tcp"),
            self.settings.base_address,
            self.port_for(purpose),
            self.settings.protocol_path,
            purpose.path_segment(),
            Uuid::new_v4()
        );
        Url::parse(&raw).map_err(|e| WireError::InvalidAddress {
            address: raw.clone(),
            reason: e.to_string(),
        })
    }

    fn discovery_address(&self) -> WireResult<Url> {
        let raw = format!(
            "{}://{}:{}/{}",
            ChannelTemplate::TcpIP.scheme().unwrap_or("net.tcp"),
            self.settings.base_address,
            self.port_for(ChannelPurpose::Messages),
            self.settings.discovery_path
        );
        Url::parse(&raw).map_err(|e| WireError::InvalidAddress {
            address: raw.clone(),
            reason: e.to_string(),
        })
    }

    fn bound_discovery_address(&self, message_address: &Url) -> WireResult<Url> {
        let mut address = self.discovery_address()?;
        if self.settings.port.is_none() {
            address
                .set_port(message_address.port())
                .map_err(|_| invalid(&address, "cannot assign port"))?;
        }
        Ok(address)
    }

    async fn listen(
        &self,
        mut address: Url,
        sink: Arc<dyn InboundSink>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> WireResult<ListenerHandle> {
        let listener = TcpListener::bind(bind_address(&address)?).await?;
        let local = listener.local_addr()?;
        address
            .set_port(Some(local.port()))
            .map_err(|_| invalid(&address, "cannot assign port"))?;
        info!(address = %address, "TCP channel listening");

        let cancel = CancellationToken::new();
        let accept = accept_loop(listener, sink, self.limits, cancel.clone());
        Ok(ListenerHandle::spawn(address, cancel, accept, events))
    }

    async fn connect(&self, address: &Url) -> WireResult<Box<dyn FrameSender>> {
        let host = address
            .host_str()
            .ok_or_else(|| invalid(address, "missing host"))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = address.port().ok_or_else(|| invalid(address, "missing port"))?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        debug!(address = %address, "TCP channel connected");
        Ok(Box::new(StreamSender::new(stream)))
    }
}

async fn accept_loop(
    listener: TcpListener,
    sink: Arc<dyn InboundSink>,
    limits: FrameLimits,
    cancel: CancellationToken,
) -> WireResult<()> {
    let permits = Arc::new(Semaphore::new(limits.max_connections));
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            permit = Arc::clone(&permits).acquire_owned() => {
                permit.map_err(|_| WireError::ConnectionClosed)?
            }
        };
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Inbound TCP connection");
                let _ = stream.set_nodelay(true);
                let sink = Arc::clone(&sink);
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    serve_connection(stream, peer.to_string(), sink, limits, cancel).await;
                    drop(permit);
                });
            }
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "Transient accept error");
            }
            Err(e) => return Err(WireError::Io(e)),
        }
    }
}

fn is_transient(error: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        error.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode_message, Frame, MessageKind, ProtocolMessage};
    use peermesh_types::EndpointId;
    use std::time::Duration;

    struct ChannelSink(mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl InboundSink for ChannelSink {
        async fn receive(&self, frame: Frame) {
            let _ = self.0.send(frame);
        }
    }

    fn transport(port: Option<u16>) -> TcpTransport {
        TcpTransport::new(
            TcpSettings {
                base_address: "127.0.0.1".to_string(),
                port,
                discovery_path: "discovery".to_string(),
                protocol_path: "protocol".to_string(),
            },
            FrameLimits::default(),
        )
    }

    #[test]
    fn test_generated_addresses() {
        let fixed = transport(Some(4000));
        let messages = fixed.generate_new_channel_uri(ChannelPurpose::Messages).unwrap();
        let data = fixed.generate_new_channel_uri(ChannelPurpose::Data).unwrap();
        assert_eq!(messages.scheme(), "net.tcp");
        assert_eq!(messages.port(), Some(4000));
        assert_eq!(data.port(), Some(4001));
        assert!(messages.path().starts_with("/protocol/messages/"));
        assert_ne!(
            fixed.generate_new_channel_uri(ChannelPurpose::Messages).unwrap(),
            messages
        );
        assert_eq!(
            fixed.discovery_address().unwrap().as_str(),
            "net.tcp://127.0.0.1:4000/discovery"
        );
    }

    #[test]
    fn test_discovery_address_follows_bound_port() {
        let bound: Url = "net.tcp://127.0.0.1:40123/protocol/messages/x".parse().unwrap();

        let auto = transport(None);
        assert_eq!(auto.discovery_address().unwrap().port(), Some(0));
        assert_eq!(
            auto.bound_discovery_address(&bound).unwrap().as_str(),
            "net.tcp://127.0.0.1:40123/discovery"
        );

        let fixed = transport(Some(4000));
        assert_eq!(fixed.bound_discovery_address(&bound).unwrap().port(), Some(4000));
    }

    #[tokio::test]
    async fn test_listen_connect_send() {
        let transport = transport(None);
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let address = transport.generate_new_channel_uri(ChannelPurpose::Messages).unwrap();
        let listener = transport
            .listen(address, Arc::new(ChannelSink(frames_tx)), events_tx)
            .await
            .unwrap();
        assert_ne!(listener.address().port(), Some(0));

        let sender = transport.connect(listener.address()).await.unwrap();
        let msg = ProtocolMessage::new(EndpointId::new("a", 1), MessageKind::EndpointDisconnect);
        sender.send_frame(&encode_message(&msg).unwrap()).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            Frame::Message(received) => assert_eq!(received.id, msg.id),
            other => panic!("Expected message, got {other:?}"),
        }

        listener.close().await;
        assert!(listener.is_terminated());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let transport = transport(None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let address: Url = format!("net.tcp://127.0.0.1:{port}/protocol/messages/x")
            .parse()
            .unwrap();
        assert!(transport.connect(&address).await.is_err());
    }
}
