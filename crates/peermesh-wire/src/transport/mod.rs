//! Channel transports.
//!
//! A transport knows how to listen on and connect to addresses of one
//! [`ChannelTemplate`]. Channels are one-way: the listening side only reads
//! frames and hands them to an [`InboundSink`], the connecting side only
//! writes frames through a [`FrameSender`].
//!
//! Listeners are supervised. When the accept loop dies without having been
//! asked to close, a [`HostEvent`] is sent so the owning channel host can
//! reopen it.

pub mod tcp;

#[cfg(unix)]
pub mod pipe;

use crate::error::{WireError, WireResult};
use crate::message::{decode_data, decode_header, decode_message, Frame, TAG_DATA, TAG_MESSAGE};
use async_trait::async_trait;
use bytes::Bytes;
use peermesh_types::config::ProtocolConfig;
use peermesh_types::ChannelTemplate;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// What a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPurpose {
    Messages,
    Data,
}

impl ChannelPurpose {
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Data => "data",
        }
    }
}

/// Reported by a listener supervisor when a listener stops on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// The accept loop failed.
    Faulted(String),
    /// The accept loop ended although nobody closed it.
    ClosedPrematurely,
}

/// Receives every frame read by a listener.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn receive(&self, frame: Frame);
}

/// Writing half of an outbound channel.
#[async_trait]
pub trait FrameSender: Send + Sync {
    /// Write one encoded frame.
    async fn send_frame(&self, frame: &[u8]) -> WireResult<()>;
    /// Shut the connection down. Further sends fail.
    async fn close(&self);
}

/// One channel technology (TCP, named pipe, ...).
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn template(&self) -> ChannelTemplate;

    /// A fresh, unique address for a new listener. The port may still be
    /// unassigned; the listener reports its final address.
    fn generate_new_channel_uri(&self, purpose: ChannelPurpose) -> WireResult<Url>;

    /// The address other endpoints use to discover this one.
    fn discovery_address(&self) -> WireResult<Url>;

    /// The discovery address once the message listener is bound to
    /// `message_address`. Transports that assign ports late fill them in.
    fn bound_discovery_address(&self, _message_address: &Url) -> WireResult<Url> {
        self.discovery_address()
    }

    /// Start listening on `address`.
    async fn listen(
        &self,
        address: Url,
        sink: Arc<dyn InboundSink>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> WireResult<ListenerHandle>;

    /// Open an outbound channel to `address`.
    async fn connect(&self, address: &Url) -> WireResult<Box<dyn FrameSender>>;
}

/// Size and idle limits applied to every inbound connection.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_message_size: u32,
    pub max_data_size: u64,
    pub receive_timeout: Duration,
    pub max_connections: usize,
}

impl FrameLimits {
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            max_data_size: config.max_data_size,
            receive_timeout: config.receive_timeout,
            max_connections: config.max_connections,
        }
    }
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self::from_config(&ProtocolConfig::default())
    }
}

/// Read one frame from a stream.
pub async fn read_frame<R>(reader: &mut R, limits: &FrameLimits) -> WireResult<Frame>
where
    R: AsyncRead + Unpin + Send,
{
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let (tag, len) = decode_header(&header);
    if len > limits.max_message_size {
        return Err(WireError::FrameTooLarge {
            size: len as u64,
            max: limits.max_message_size as u64,
        });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    match tag {
        TAG_MESSAGE => Ok(Frame::Message(decode_message(&body)?)),
        TAG_DATA => {
            let size = reader.read_u64().await?;
            if size > limits.max_data_size {
                return Err(WireError::FrameTooLarge {
                    size,
                    max: limits.max_data_size,
                });
            }
            let mut data = vec![0u8; size as usize];
            reader.read_exact(&mut data).await?;
            Ok(Frame::Data(decode_data(&body, Bytes::from(data))?))
        }
        other => Err(WireError::UnknownFrame(other)),
    }
}

/// Write one encoded frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> WireResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read frames from one inbound connection until it closes, idles out or
/// the listener is cancelled.
pub(crate) async fn serve_connection<R>(
    mut reader: R,
    peer: String,
    sink: Arc<dyn InboundSink>,
    limits: FrameLimits,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(
                limits.receive_timeout,
                read_frame(&mut reader, &limits),
            ) => read,
        };
        match read {
            Ok(Ok(frame)) => sink.receive(frame).await,
            Ok(Err(WireError::ConnectionClosed)) => {
                debug!(peer = %peer, "Inbound connection closed");
                break;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Dropping inbound connection");
                break;
            }
            Err(_) => {
                debug!(peer = %peer, "Inbound connection idle, closing");
                break;
            }
        }
    }
}

/// A running, supervised listener.
///
/// Dropping the handle stops the listener without reporting an event.
pub struct ListenerHandle {
    address: Url,
    cancel: CancellationToken,
    terminated: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHandle {
    /// Run `accept` as a listener task under a supervisor.
    ///
    /// `accept` must return once `cancel` fires. If it returns for any
    /// other reason, or panics, the supervisor reports it on `events`.
    pub fn spawn<F>(
        address: Url,
        cancel: CancellationToken,
        accept: F,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self
    where
        F: Future<Output = WireResult<()>> + Send + 'static,
    {
        let terminated = Arc::new(AtomicBool::new(false));
        let accept_task = tokio::spawn(accept);

        let supervisor = {
            let cancel = cancel.clone();
            let terminated = Arc::clone(&terminated);
            let address = address.clone();
            tokio::spawn(async move {
                let outcome = accept_task.await;
                terminated.store(true, Ordering::SeqCst);
                if cancel.is_cancelled() {
                    return;
                }
                let event = match outcome {
                    Ok(Ok(())) => HostEvent::ClosedPrematurely,
                    Ok(Err(e)) => HostEvent::Faulted(e.to_string()),
                    Err(e) => HostEvent::Faulted(format!("listener task failed: {e}")),
                };
                warn!(address = %address, event = ?event, "Listener stopped unexpectedly");
                let _ = events.send(event);
            })
        };

        Self {
            address,
            cancel,
            terminated,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// The address the listener is reachable on.
    pub fn address(&self) -> &Url {
        &self.address
    }

    /// Whether the accept loop has stopped.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Stop the listener and wait for it to wind down.
    pub async fn close(&self) {
        self.cancel.cancel();
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// [`FrameSender`] over any writable stream.
pub struct StreamSender<W> {
    writer: tokio::sync::Mutex<Option<W>>,
}

impl<W> StreamSender<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }
}

#[async_trait]
impl<W> FrameSender for StreamSender<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&self, frame: &[u8]) -> WireResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(WireError::ConnectionClosed)?;
        if let Err(e) = write_frame(writer, frame).await {
            // A broken stream is never reused.
            *guard = None;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        encode_data, encode_message, DataTransferMessage, MessageKind, ProtocolMessage,
    };
    use peermesh_types::{EndpointId, MessageId};

    #[tokio::test]
    async fn test_read_frame_message_and_data() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let msg = ProtocolMessage::new(EndpointId::new("a", 1), MessageKind::EndpointDisconnect);
        let transfer = DataTransferMessage {
            id: MessageId::new(),
            sender: EndpointId::new("a", 1),
            receiver: EndpointId::new("b", 2),
            responding_to: MessageId::new(),
            data: Bytes::from_static(b"payload"),
        };
        write_frame(&mut client, &encode_message(&msg).unwrap()).await.unwrap();
        write_frame(&mut client, &encode_data(&transfer).unwrap()).await.unwrap();
        drop(client);

        let limits = FrameLimits::default();
        match read_frame(&mut server, &limits).await.unwrap() {
            Frame::Message(m) => assert_eq!(m.id, msg.id),
            other => panic!("Expected message, got {other:?}"),
        }
        match read_frame(&mut server, &limits).await.unwrap() {
            Frame::Data(d) => assert_eq!(&d.data[..], b"payload"),
            other => panic!("Expected data, got {other:?}"),
        }
        assert!(matches!(
            read_frame(&mut server, &limits).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[TAG_MESSAGE, 0, 1, 0, 0]).await.unwrap();
        let limits = FrameLimits {
            max_message_size: 1024,
            ..FrameLimits::default()
        };
        assert!(matches!(
            read_frame(&mut server, &limits).await,
            Err(WireError::FrameTooLarge { size: 65536, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_unknown_tag() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[9, 0, 0, 0, 2, b'{', b'}']).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, &FrameLimits::default()).await,
            Err(WireError::UnknownFrame(9))
        ));
    }

    #[tokio::test]
    async fn test_supervisor_reports_premature_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ListenerHandle::spawn(
            "net.tcp://localhost:1/x".parse().unwrap(),
            CancellationToken::new(),
            async { Ok(()) },
            tx,
        );
        assert_eq!(rx.recv().await, Some(HostEvent::ClosedPrematurely));
        assert!(handle.is_terminated());
    }

    #[tokio::test]
    async fn test_supervisor_reports_fault() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = ListenerHandle::spawn(
            "net.tcp://localhost:1/x".parse().unwrap(),
            CancellationToken::new(),
            async { Err(WireError::ConnectionClosed) },
            tx,
        );
        assert!(matches!(rx.recv().await, Some(HostEvent::Faulted(_))));
    }

    #[tokio::test]
    async fn test_close_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let handle = ListenerHandle::spawn(
            "net.tcp://localhost:1/x".parse().unwrap(),
            cancel,
            async move {
                accept_cancel.cancelled().await;
                Ok(())
            },
            tx,
        );
        handle.close().await;
        assert!(handle.is_terminated());
        drop(handle);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_stream_sender_fails_after_close() {
        let (client, _server) = tokio::io::duplex(1024);
        let sender = StreamSender::new(client);
        sender.send_frame(b"abc").await.unwrap();
        sender.close().await;
        assert!(matches!(
            sender.send_frame(b"abc").await,
            Err(WireError::ConnectionClosed)
        ));
    }
}
