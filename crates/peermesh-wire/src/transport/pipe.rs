//! Named-pipe channels (`net.pipe://localhost/path`), backed by Unix domain
//! sockets under the system temp directory.

use super::{
    serve_connection, ChannelPurpose, ChannelTransport, FrameLimits, FrameSender, HostEvent,
    InboundSink, ListenerHandle, StreamSender,
};
use crate::error::{WireError, WireResult};
use async_trait::async_trait;
use peermesh_types::config::ProtocolConfig;
use peermesh_types::ChannelTemplate;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Named-pipe implementation of [`ChannelTransport`].
pub struct PipeTransport {
    socket_dir: PathBuf,
    discovery_path: String,
    protocol_path: String,
    limits: FrameLimits,
}

impl PipeTransport {
    pub fn new(
        socket_dir: PathBuf,
        discovery_path: String,
        protocol_path: String,
        limits: FrameLimits,
    ) -> Self {
        Self {
            socket_dir,
            discovery_path,
            protocol_path,
            limits,
        }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(
            std::env::temp_dir().join("peermesh"),
            config.pipe_discovery_path.clone(),
            config.pipe_protocol_path.clone(),
            FrameLimits::from_config(config),
        )
    }

    /// Socket file backing `address`. Only the last path segment is used,
    /// which keeps the path under the platform's socket name limit.
    fn socket_path(&self, address: &Url) -> WireResult<PathBuf> {
        let name = address
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| WireError::InvalidAddress {
                address: address.to_string(),
                reason: "missing pipe name".to_string(),
            })?;
        Ok(self.socket_dir.join(format!("{name}.sock")))
    }
}

#[async_trait]
impl ChannelTransport for PipeTransport {
    fn template(&self) -> ChannelTemplate {
        ChannelTemplate::NamedPipe
    }

    fn generate_new_channel_uri(&self, purpose: ChannelPurpose) -> WireResult<Url> {
        let raw = format!(
            "net.pipe://localhost/{}/{}/{}",
            self.protocol_path,
            purpose.path_segment(),
            Uuid::new_v4()
        );
        Url::parse(&raw).map_err(|e| WireError::InvalidAddress {
            address: raw.clone(),
            reason: e.to_string(),
        })
    }

    fn discovery_address(&self) -> WireResult<Url> {
        let raw = format!("net.pipe://localhost/{}", self.discovery_path);
        Url::parse(&raw).map_err(|e| WireError::InvalidAddress {
            address: raw.clone(),
            reason: e.to_string(),
        })
    }

    async fn listen(
        &self,
        address: Url,
        sink: Arc<dyn InboundSink>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> WireResult<ListenerHandle> {
        let path = self.socket_path(&address)?;
        tokio::fs::create_dir_all(&self.socket_dir).await?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_file(&path).await?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(address = %address, path = %path.display(), "Pipe channel listening");

        let cancel = CancellationToken::new();
        let accept = accept_loop(listener, path, sink, self.limits, cancel.clone());
        Ok(ListenerHandle::spawn(address, cancel, accept, events))
    }

    async fn connect(&self, address: &Url) -> WireResult<Box<dyn FrameSender>> {
        let path = self.socket_path(address)?;
        let stream = UnixStream::connect(&path).await?;
        debug!(address = %address, "Pipe channel connected");
        Ok(Box::new(StreamSender::new(stream)))
    }
}

async fn accept_loop(
    listener: UnixListener,
    path: PathBuf,
    sink: Arc<dyn InboundSink>,
    limits: FrameLimits,
    cancel: CancellationToken,
) -> WireResult<()> {
    let permits = Arc::new(Semaphore::new(limits.max_connections));
    let result = loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break Err(WireError::ConnectionClosed),
            },
        };
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let sink = Arc::clone(&sink);
                let cancel = cancel.child_token();
                let peer = path.display().to_string();
                tokio::spawn(async move {
                    serve_connection(stream, peer, sink, limits, cancel).await;
                    drop(permit);
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                warn!(error = %e, "Transient accept error");
            }
            Err(e) => break Err(WireError::Io(e)),
        }
    };
    let _ = std::fs::remove_file(&path);
    result
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

    #[tokio::test]
    async fn test_pipe_roundtrip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let transport = PipeTransport::new(
            dir.path().to_path_buf(),
            "discovery".to_string(),
            "protocol".to_string(),
            FrameLimits::default(),
        );
        let address = transport.generate_new_channel_uri(ChannelPurpose::Messages).unwrap();
        assert_eq!(address.scheme(), "net.pipe");

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let listener = transport
            .listen(address.clone(), Arc::new(ChannelSink(frames_tx)), events_tx)
            .await
            .unwrap();
        let socket = transport.socket_path(&address).unwrap();
        assert!(socket.exists());

        let sender = transport.connect(&address).await.unwrap();
        let msg = ProtocolMessage::new(EndpointId::new("a", 1), MessageKind::EndpointDisconnect);
        sender.send_frame(&encode_message(&msg).unwrap()).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Frame::Message(m) if m.id == msg.id));

        listener.close().await;
        assert!(!socket.exists());
    }
}
