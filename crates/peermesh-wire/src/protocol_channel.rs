//! Protocol channel: one transport's message and data channels.
//!
//! A [`ProtocolChannel`] owns a [`ChannelHost`] for inbound messages and one
//! for inbound data, plus a cache of outbound senders keyed by the remote's
//! [`ProtocolInformation`]. Outbound connections are made lazily on first
//! send and reused until the remote disconnects or the channel is reopened.

use crate::error::{WireError, WireResult};
use crate::host::{ChannelHost, HostNotice};
use crate::message::{
    encode_data, encode_message, DataTransferMessage, MessageKind, ProtocolMessage,
    PROTOCOL_VERSION,
};
use crate::transport::{ChannelPurpose, ChannelTransport, FrameSender, InboundSink};
use bytes::Bytes;
use peermesh_types::{ChannelTemplate, EndpointId, MessageId, ProtocolInformation, ProtocolVersion};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Lifecycle events of a protocol channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel was closed locally.
    Closed(ChannelTemplate),
    /// A host reopened and the local addresses changed.
    AddressChanged(ProtocolInformation),
    /// A host hit its restart limit. The channel is unusable.
    Failed {
        template: ChannelTemplate,
        reason: String,
    },
}

type SenderSlot = tokio::sync::Mutex<Option<Box<dyn FrameSender>>>;

/// Cached outbound connections to one remote endpoint.
struct SendingEndpoint {
    remote: ProtocolInformation,
    messages: SenderSlot,
    data: SenderSlot,
}

impl SendingEndpoint {
    fn new(remote: ProtocolInformation) -> Self {
        Self {
            remote,
            messages: tokio::sync::Mutex::new(None),
            data: tokio::sync::Mutex::new(None),
        }
    }

    async fn close(&self) {
        for slot in [&self.messages, &self.data] {
            if let Some(sender) = slot.lock().await.take() {
                sender.close().await;
            }
        }
    }
}

/// Write `frame` through `slot`, connecting first if needed. A failed
/// connection is dropped and rebuilt up to `retry_count` times.
async fn send_through(
    transport: &dyn ChannelTransport,
    slot: &SenderSlot,
    address: &Url,
    frame: &[u8],
    retry_count: u32,
) -> WireResult<()> {
    let mut attempt = 0;
    loop {
        let mut guard = slot.lock().await;
        let result = match guard.as_ref() {
            Some(sender) => sender.send_frame(frame).await,
            None => match transport.connect(address).await {
                Ok(sender) => {
                    let sent = sender.send_frame(frame).await;
                    *guard = Some(sender);
                    sent
                }
                Err(e) => Err(e),
            },
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                if let Some(broken) = guard.take() {
                    broken.close().await;
                }
                drop(guard);
                if attempt >= retry_count {
                    return Err(e);
                }
                attempt += 1;
                debug!(address = %address, attempt, error = %e, "Send failed, retrying");
            }
        }
    }
}

/// Open/close/send surface of one channel template.
pub struct ProtocolChannel {
    local_id: EndpointId,
    transport: Arc<dyn ChannelTransport>,
    message_host: ChannelHost,
    data_host: ChannelHost,
    sink: Arc<dyn InboundSink>,
    senders: Mutex<HashMap<ProtocolInformation, Arc<SendingEndpoint>>>,
    local: RwLock<Option<ProtocolInformation>>,
    events: broadcast::Sender<ChannelEvent>,
    notice_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolChannel {
    /// Create a closed channel. Every inbound frame goes to `sink`.
    pub fn new(
        local_id: EndpointId,
        transport: Arc<dyn ChannelTransport>,
        sink: Arc<dyn InboundSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            local_id,
            message_host: ChannelHost::new(Arc::clone(&transport), ChannelPurpose::Messages),
            data_host: ChannelHost::new(Arc::clone(&transport), ChannelPurpose::Data),
            transport,
            sink,
            senders: Mutex::new(HashMap::new()),
            local: RwLock::new(None),
            events,
            notice_task: Mutex::new(None),
        })
    }

    pub fn template(&self) -> ChannelTemplate {
        self.transport.template()
    }

    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Where remote endpoints reach this channel, if open.
    pub fn local_information(&self) -> Option<ProtocolInformation> {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_open(&self) -> bool {
        self.local_information().is_some()
    }

    /// Open both hosts. Reopening an open channel first tells every cached
    /// remote that this endpoint is going away and drops the cache.
    pub async fn open_channel(self: &Arc<Self>) -> WireResult<ProtocolInformation> {
        if self.is_open() {
            debug!(template = %self.template(), "Reopening open channel");
            self.disconnect_cached_endpoints().await;
            self.stop_notice_task();
        }

        let message_address = self.message_host.open_channel(Arc::clone(&self.sink)).await?;
        let data_address = match self.data_host.open_channel(Arc::clone(&self.sink)).await {
            Ok(address) => address,
            Err(e) => {
                self.message_host.close_connection().await;
                return Err(e);
            }
        };
        let info = ProtocolInformation::new(PROTOCOL_VERSION, message_address, Some(data_address));
        *self.local.write().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());

        let task = tokio::spawn(forward_notices(
            Arc::downgrade(self),
            self.message_host.subscribe(),
            self.data_host.subscribe(),
        ));
        *self.notice_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        info!(
            template = %self.template(),
            messages = %info.message_address,
            "Protocol channel open"
        );
        Ok(info)
    }

    /// Close both hosts and drop every cached sender.
    pub async fn close_channel(&self) {
        self.stop_notice_task();
        self.message_host.close_connection().await;
        self.data_host.close_connection().await;
        for endpoint in self.drain_senders() {
            endpoint.close().await;
        }
        let was_open = self
            .local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if was_open {
            info!(template = %self.template(), "Protocol channel closed");
            let _ = self.events.send(ChannelEvent::Closed(self.template()));
        }
    }

    /// Send a message to `remote`, retrying a failed connection
    /// `retry_count` times.
    pub async fn send(
        &self,
        remote: &ProtocolInformation,
        message: &ProtocolMessage,
        retry_count: u32,
    ) -> WireResult<()> {
        if !self.is_open() {
            return Err(WireError::ChannelNotOpen(self.template()));
        }
        let frame = encode_message(message)?;
        let endpoint = self.sender_for(remote);
        send_through(
            self.transport.as_ref(),
            &endpoint.messages,
            &endpoint.remote.message_address,
            &frame,
            retry_count,
        )
        .await
    }

    /// Push the file at `path` to `remote`'s data channel as the answer to
    /// `responding_to`.
    pub async fn transfer_data(
        &self,
        remote: &ProtocolInformation,
        receiver: &EndpointId,
        responding_to: MessageId,
        path: &Path,
        cancel: CancellationToken,
        retry_count: u32,
    ) -> WireResult<()> {
        if !self.is_open() {
            return Err(WireError::ChannelNotOpen(self.template()));
        }
        let address = remote
            .data_address
            .clone()
            .ok_or_else(|| WireError::InvalidAddress {
                address: remote.message_address.to_string(),
                reason: "endpoint has no data channel".to_string(),
            })?;

        let data = tokio::select! {
            _ = cancel.cancelled() => return Err(WireError::Cancelled),
            data = tokio::fs::read(path) => data?,
        };
        let transfer = DataTransferMessage {
            id: MessageId::new(),
            sender: self.local_id.clone(),
            receiver: receiver.clone(),
            responding_to,
            data: Bytes::from(data),
        };
        let frame = encode_data(&transfer)?;
        let endpoint = self.sender_for(remote);

        tokio::select! {
            _ = cancel.cancelled() => Err(WireError::Cancelled),
            sent = send_through(
                self.transport.as_ref(),
                &endpoint.data,
                &address,
                &frame,
                retry_count,
            ) => {
                if sent.is_ok() {
                    debug!(
                        receiver = %receiver,
                        bytes = transfer.data.len(),
                        "Data transferred"
                    );
                }
                sent
            }
        }
    }

    /// Drop the cached sender for a remote that went away.
    pub async fn endpoint_disconnected(&self, remote: &ProtocolInformation) {
        let removed = {
            let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
            senders.remove(remote)
        };
        if let Some(endpoint) = removed {
            debug!(remote = %remote.message_address, "Dropping cached sender");
            endpoint.close().await;
        }
    }

    /// Number of remotes with a cached sender.
    pub fn cached_senders(&self) -> usize {
        self.senders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn sender_for(&self, remote: &ProtocolInformation) -> Arc<SendingEndpoint> {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        let endpoint = senders
            .entry(remote.clone())
            .or_insert_with(|| Arc::new(SendingEndpoint::new(remote.clone())));
        Arc::clone(endpoint)
    }

    fn drain_senders(&self) -> Vec<Arc<SendingEndpoint>> {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.drain().map(|(_, endpoint)| endpoint).collect()
    }

    fn stop_notice_task(&self) {
        if let Some(task) = self
            .notice_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    async fn disconnect_cached_endpoints(&self) {
        for endpoint in self.drain_senders() {
            let goodbye =
                ProtocolMessage::new(self.local_id.clone(), MessageKind::EndpointDisconnect);
            if let Ok(frame) = encode_message(&goodbye) {
                if let Err(e) = send_through(
                    self.transport.as_ref(),
                    &endpoint.messages,
                    &endpoint.remote.message_address,
                    &frame,
                    0,
                )
                .await
                {
                    debug!(
                        remote = %endpoint.remote.message_address,
                        error = %e,
                        "Disconnect notice not delivered"
                    );
                }
            }
            endpoint.close().await;
        }
    }

    fn apply_notice(&self, purpose: ChannelPurpose, notice: HostNotice) {
        match notice {
            HostNotice::Reopened(address) => {
                let updated = {
                    let mut local = self.local.write().unwrap_or_else(|e| e.into_inner());
                    let Some(info) = local.as_mut() else {
                        return;
                    };
                    match purpose {
                        ChannelPurpose::Messages => info.message_address = address,
                        ChannelPurpose::Data => info.data_address = Some(address),
                    }
                    info.clone()
                };
                let _ = self.events.send(ChannelEvent::AddressChanged(updated));
            }
            HostNotice::Failed(reason) => {
                warn!(template = %self.template(), reason = %reason, "Protocol channel failed");
                let _ = self.events.send(ChannelEvent::Failed {
                    template: self.template(),
                    reason,
                });
            }
        }
    }
}

async fn forward_notices(
    channel: Weak<ProtocolChannel>,
    mut messages: broadcast::Receiver<HostNotice>,
    mut data: broadcast::Receiver<HostNotice>,
) {
    loop {
        let (purpose, notice) = tokio::select! {
            notice = messages.recv() => (ChannelPurpose::Messages, notice),
            notice = data.recv() => (ChannelPurpose::Data, notice),
        };
        let notice = match notice {
            Ok(notice) => notice,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(channel) = channel.upgrade() else {
            return;
        };
        channel.apply_notice(purpose, notice);
    }
}

/// From the protocols a remote advertises, pick the highest version this
/// node supports on one of its templates.
pub fn select_protocol(
    offered: &[ProtocolInformation],
    supported_versions: &[ProtocolVersion],
    templates: &[ChannelTemplate],
) -> Option<ProtocolInformation> {
    offered
        .iter()
        .filter(|p| supported_versions.contains(&p.version))
        .filter(|p| templates.contains(&p.channel_template()))
        .max_by(|a, b| {
            a.version.cmp(&b.version).then_with(|| {
                // Prefer the earlier-listed template on a version tie.
                let rank = |p: &ProtocolInformation| {
                    templates
                        .iter()
                        .position(|t| *t == p.channel_template())
                        .unwrap_or(usize::MAX)
                };
                rank(b).cmp(&rank(a))
            })
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Frame;
    use crate::transport::tcp::{TcpSettings, TcpTransport};
    use crate::transport::FrameLimits;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl InboundSink for ChannelSink {
        async fn receive(&self, frame: Frame) {
            let _ = self.0.send(frame);
        }
    }

    fn tcp() -> Arc<dyn ChannelTransport> {
        Arc::new(TcpTransport::new(
            TcpSettings {
                base_address: "127.0.0.1".to_string(),
                port: None,
                discovery_path: "discovery".to_string(),
                protocol_path: "protocol".to_string(),
            },
            FrameLimits::default(),
        ))
    }

    fn channel(machine: &str) -> (Arc<ProtocolChannel>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel =
            ProtocolChannel::new(EndpointId::new(machine, 1), tcp(), Arc::new(ChannelSink(tx)));
        (channel, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame")
            .expect("open")
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (a, _) = channel("a");
        let remote = ProtocolInformation::new(
            PROTOCOL_VERSION,
            "net.tcp://127.0.0.1:1/protocol/messages/x".parse().unwrap(),
            None,
        );
        let msg = ProtocolMessage::new(EndpointId::new("a", 1), MessageKind::EndpointDisconnect);
        assert!(matches!(
            a.send(&remote, &msg, 0).await,
            Err(WireError::ChannelNotOpen(ChannelTemplate::TcpIP))
        ));
    }

    #[tokio::test]
    async fn test_send_caches_sender() {
        let (a, _) = channel("a");
        let (b, mut b_rx) = channel("b");
        a.open_channel().await.unwrap();
        let b_info = b.open_channel().await.unwrap();

        for _ in 0..2 {
            let msg =
                ProtocolMessage::new(EndpointId::new("a", 1), MessageKind::EndpointDisconnect);
            a.send(&b_info, &msg, 0).await.unwrap();
            assert!(matches!(next(&mut b_rx).await, Frame::Message(m) if m.id == msg.id));
        }
        assert_eq!(a.cached_senders(), 1);

        a.endpoint_disconnected(&b_info).await;
        assert_eq!(a.cached_senders(), 0);
    }

    #[tokio::test]
    async fn test_reopen_notifies_cached_remotes() {
        let (a, _) = channel("a");
        let (b, mut b_rx) = channel("b");
        let first = a.open_channel().await.unwrap();
        let b_info = b.open_channel().await.unwrap();

        let hello = ProtocolMessage::new(EndpointId::new("a", 1), MessageKind::EndpointDisconnect);
        a.send(&b_info, &hello, 0).await.unwrap();
        next(&mut b_rx).await;

        let second = a.open_channel().await.unwrap();
        assert_ne!(first.message_address, second.message_address);
        match next(&mut b_rx).await {
            Frame::Message(m) => {
                assert_eq!(m.sender, EndpointId::new("a", 1));
                assert!(matches!(m.kind, MessageKind::EndpointDisconnect));
            }
            other => panic!("Expected disconnect, got {other:?}"),
        }
        assert_eq!(a.cached_senders(), 0);
    }

    #[tokio::test]
    async fn test_transfer_data_and_close() {
        let (a, _) = channel("a");
        let (b, mut b_rx) = channel("b");
        a.open_channel().await.unwrap();
        let b_info = b.open_channel().await.unwrap();
        let mut events = b.subscribe();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        tokio::fs::write(&path, b"some bytes").await.unwrap();
        let request = MessageId::new();
        a.transfer_data(
            &b_info,
            &EndpointId::new("b", 1),
            request,
            &path,
            CancellationToken::new(),
            0,
        )
        .await
        .unwrap();
        match next(&mut b_rx).await {
            Frame::Data(d) => {
                assert_eq!(d.responding_to, request);
                assert_eq!(&d.data[..], b"some bytes");
            }
            other => panic!("Expected data, got {other:?}"),
        }

        b.close_channel().await;
        assert!(!b.is_open());
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Closed(ChannelTemplate::TcpIP)
        );
    }

    #[tokio::test]
    async fn test_cancelled_transfer() {
        let (a, _) = channel("a");
        let (b, _) = channel("b");
        a.open_channel().await.unwrap();
        let b_info = b.open_channel().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        tokio::fs::write(&path, b"x").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            a.transfer_data(&b_info, &EndpointId::new("b", 1), MessageId::new(), &path, cancel, 0)
                .await,
            Err(WireError::Cancelled)
        ));
    }

    #[test]
    fn test_select_protocol_prefers_highest_supported() {
        let tcp_v1 = ProtocolInformation::new(
            ProtocolVersion::new(1, 0),
            "net.tcp://h:1/protocol/messages/a".parse().unwrap(),
            None,
        );
        let tcp_v2 = ProtocolInformation::new(
            ProtocolVersion::new(2, 0),
            "net.tcp://h:1/protocol/messages/b".parse().unwrap(),
            None,
        );
        let pipe_v1 = ProtocolInformation::new(
            ProtocolVersion::new(1, 0),
            "net.pipe://localhost/protocol/messages/c".parse().unwrap(),
            None,
        );
        let offered = vec![pipe_v1.clone(), tcp_v1.clone(), tcp_v2];

        let picked = select_protocol(
            &offered,
            &[ProtocolVersion::new(1, 0)],
            &[ChannelTemplate::NamedPipe, ChannelTemplate::TcpIP],
        );
        assert_eq!(picked, Some(pipe_v1));

        let picked =
            select_protocol(&offered, &[ProtocolVersion::new(1, 0)], &[ChannelTemplate::TcpIP]);
        assert_eq!(picked, Some(tcp_v1));

        assert_eq!(
            select_protocol(&offered, &[ProtocolVersion::new(3, 0)], &[ChannelTemplate::TcpIP]),
            None
        );
    }
}
