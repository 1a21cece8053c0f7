//! Protocol layer: the facade an application embeds.
//!
//! The layer owns one [`ProtocolChannel`] per allowed channel template, the
//! endpoint directory, the message and data handlers, the handshake
//! conductor, the connection monitor and the discovery sources. It walks
//! through `SignedOut -> SigningIn -> SignedIn -> SigningOut -> SignedOut`
//! and reports what happens on a [`ProtocolEvent`] broadcast.

use crate::data::DataHandler;
use crate::directory::{DirectoryEvent, EndpointDirectory};
use crate::discovery::{DiscoveredEndpoint, DiscoveryEvent, DiscoverySource};
use crate::error::{WireError, WireResult};
use crate::handler::{MessageAction, MessageFilter, MessageHandler};
use crate::handshake::{ApproveEndpointConnections, HandshakeConductor, LocalDescription};
use crate::message::{Frame, MessageKind, MessageType, ProtocolMessage, PROTOCOL_VERSION};
use crate::messenger::ProtocolMessenger;
use crate::monitor::{ConnectionMonitor, KeepAliveDataBuilder, MonitorConfig};
use crate::protocol_channel::{select_protocol, ChannelEvent, ProtocolChannel};
use crate::transport::tcp::TcpTransport;
use crate::transport::{ChannelTransport, InboundSink};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use peermesh_types::config::ProtocolConfig;
use peermesh_types::{
    ChannelTemplate, CommunicationSubject, DiscoveryInformation, EndpointId, EndpointInformation,
    MessageId, ProtocolInformation,
};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long sign-out waits for each goodbye to be delivered.
const DISCONNECT_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    SignedOut,
    SigningIn,
    SignedIn,
    SigningOut,
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignedOut => write!(f, "signed_out"),
            Self::SigningIn => write!(f, "signing_in"),
            Self::SignedIn => write!(f, "signed_in"),
            Self::SigningOut => write!(f, "signing_out"),
        }
    }
}

/// Something the embedding application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    SignedIn,
    SignedOut,
    EndpointConnected(EndpointInformation),
    EndpointDisconnected(EndpointId),
    /// A channel hit its restart limit and is no longer usable.
    ChannelFailed {
        template: ChannelTemplate,
        reason: String,
    },
}

/// Answers a download request with the file to send back.
///
/// Called with the requesting endpoint and the request payload.
pub type UploadSource = Arc<
    dyn Fn(EndpointId, serde_json::Value) -> BoxFuture<'static, WireResult<PathBuf>> + Send + Sync,
>;

/// Assembles a [`ProtocolLayer`].
pub struct ProtocolLayerBuilder {
    config: ProtocolConfig,
    endpoint_id: Option<EndpointId>,
    description: LocalDescription,
    transports: Vec<Arc<dyn ChannelTransport>>,
    discovery: Vec<Arc<dyn DiscoverySource>>,
    approvers: Vec<Arc<dyn ApproveEndpointConnections>>,
}

impl ProtocolLayerBuilder {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            endpoint_id: None,
            description: LocalDescription::default(),
            transports: Vec::new(),
            discovery: Vec::new(),
            approvers: Vec::new(),
        }
    }

    /// Use an explicit identity instead of machine name and process id.
    pub fn endpoint_id(mut self, id: EndpointId) -> Self {
        self.endpoint_id = Some(id);
        self
    }

    pub fn subject(mut self, subject: CommunicationSubject) -> Self {
        self.description.subjects.push(subject);
        self
    }

    pub fn subjects(mut self, subjects: impl IntoIterator<Item = CommunicationSubject>) -> Self {
        self.description.subjects.extend(subjects);
        self
    }

    pub fn command_proxies(mut self, proxies: Vec<String>) -> Self {
        self.description.command_proxies = proxies;
        self
    }

    pub fn notification_proxies(mut self, proxies: Vec<String>) -> Self {
        self.description.notification_proxies = proxies;
        self
    }

    /// Allow a channel template. The first transport added is preferred
    /// when a remote offers several. Without any, TCP is used.
    pub fn transport(mut self, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn discovery_source(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.discovery.push(source);
        self
    }

    pub fn approver(mut self, approver: Arc<dyn ApproveEndpointConnections>) -> Self {
        self.approvers.push(approver);
        self
    }

    pub fn build(self) -> WireResult<ProtocolLayer> {
        let mut transports = self.transports;
        if transports.is_empty() {
            transports.push(Arc::new(TcpTransport::from_config(&self.config)));
        }

        let mut template_order = Vec::with_capacity(transports.len());
        let mut by_template: HashMap<ChannelTemplate, Arc<dyn ChannelTransport>> = HashMap::new();
        for transport in transports {
            let template = transport.template().ensure_usable()?;
            if matches!(template, ChannelTemplate::Http | ChannelTemplate::Https) {
                return Err(WireError::UnsupportedChannelTemplate(template));
            }
            if by_template.insert(template, transport).is_none() {
                template_order.push(template);
            }
        }

        let primary = template_order
            .first()
            .and_then(|template| by_template.get(template))
            .ok_or(WireError::UnsupportedChannelTemplate(ChannelTemplate::None))?;
        let id = self.endpoint_id.unwrap_or_else(EndpointId::for_current_process);
        let (announcement, _) = watch::channel(DiscoveredEndpoint {
            id: id.clone(),
            discovery: DiscoveryInformation::new(PROTOCOL_VERSION, primary.discovery_address()?),
            protocols: Vec::new(),
        });
        let (events, _) = broadcast::channel(256);
        let directory = Arc::new(EndpointDirectory::new());
        let config = self.config;
        let description = self.description;

        let inner = Arc::new_cyclic(|weak: &Weak<LayerInner>| {
            let messenger: Weak<dyn ProtocolMessenger> = weak.clone();
            let conductor = Arc::new(HandshakeConductor::new(
                messenger.clone(),
                Arc::clone(&directory),
                description,
                config.wait_for_connection,
            ));
            let monitor = Arc::new(ConnectionMonitor::new(
                messenger,
                Arc::clone(&directory),
                MonitorConfig::from_config(&config),
            ));
            LayerInner {
                id,
                self_ref: weak.clone(),
                state: Mutex::new(LayerState::SignedOut),
                lifecycle: tokio::sync::Mutex::new(()),
                open_lock: tokio::sync::Mutex::new(()),
                transports: by_template,
                template_order,
                channels: DashMap::new(),
                channel_tasks: Mutex::new(Vec::new()),
                sink: Arc::new(LayerSink(weak.clone())),
                messages: MessageHandler::new(Arc::clone(&directory)),
                data: DataHandler::new(),
                directory,
                conductor,
                monitor,
                discovery: self.discovery,
                discovery_task: Mutex::new(None),
                announcement,
                upload_source: RwLock::new(None),
                events,
                wait_for_response: config.wait_for_response,
            }
        });

        for approver in self.approvers {
            inner.conductor.register_approver(approver);
        }
        inner.conductor.register_actions(&inner.messages);
        LayerInner::register_actions(&inner);
        LayerInner::watch_directory(&inner);

        Ok(ProtocolLayer { inner })
    }
}

/// The protocol layer facade. Cloning shares the same layer.
#[derive(Clone)]
pub struct ProtocolLayer {
    inner: Arc<LayerInner>,
}

impl ProtocolLayer {
    pub fn builder(config: ProtocolConfig) -> ProtocolLayerBuilder {
        ProtocolLayerBuilder::new(config)
    }

    pub fn id(&self) -> &EndpointId {
        &self.inner.id
    }

    pub fn state(&self) -> LayerState {
        self.inner.state()
    }

    pub fn is_signed_in(&self) -> bool {
        self.state() == LayerState::SignedIn
    }

    pub fn events(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.inner.events.subscribe()
    }

    pub fn directory(&self) -> &Arc<EndpointDirectory> {
        &self.inner.directory
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.inner.monitor
    }

    /// The messenger the layer implements, for components layered on top.
    pub fn messenger(&self) -> Arc<dyn ProtocolMessenger> {
        self.inner.clone()
    }

    /// Channel templates this layer may open, preferred first.
    pub fn allowed_templates(&self) -> &[ChannelTemplate] {
        &self.inner.template_order
    }

    /// Where remote endpoints reach the channel for `template`, if open.
    pub fn local_information(&self, template: ChannelTemplate) -> Option<ProtocolInformation> {
        self.inner
            .channels
            .get(&template)
            .and_then(|channel| channel.local_information())
    }

    /// How discovery currently describes this endpoint.
    pub fn local_endpoint(&self) -> DiscoveredEndpoint {
        self.inner.announcement.borrow().clone()
    }

    /// Ids of every connected endpoint.
    pub fn known_endpoints(&self) -> Vec<EndpointId> {
        self.inner.directory.known_endpoints()
    }

    /// Open every allowed channel and start discovery. Signing in a signed
    /// in layer does nothing.
    pub async fn sign_in(&self) -> WireResult<()> {
        LayerInner::sign_in(&self.inner).await
    }

    /// Say goodbye to every connected endpoint, stop discovery and close
    /// every channel. Signing out a signed out layer does nothing.
    pub async fn sign_out(&self) {
        self.inner.sign_out().await
    }

    /// Handshake with an endpoint learned outside of discovery.
    pub async fn connect_to(&self, remote: EndpointInformation) -> WireResult<bool> {
        self.inner.ensure_active()?;
        self.inner.conductor.on_endpoint_becoming_available(remote).await
    }

    pub async fn send_message_to(
        &self,
        endpoint: &EndpointId,
        message: ProtocolMessage,
        retry_count: u32,
    ) -> WireResult<()> {
        self.inner.send_message_to(endpoint, message, retry_count).await
    }

    pub async fn send_message_and_wait_for_response(
        &self,
        endpoint: &EndpointId,
        message: ProtocolMessage,
        retry_count: u32,
        timeout: Duration,
    ) -> WireResult<ProtocolMessage> {
        self.inner
            .send_message_and_wait_for_response(endpoint, message, retry_count, timeout)
            .await
    }

    /// Send a message and wait for the reply as long as the configured
    /// `protocol.wait_for_response_ms` allows.
    pub async fn request(
        &self,
        endpoint: &EndpointId,
        message: ProtocolMessage,
        retry_count: u32,
    ) -> WireResult<ProtocolMessage> {
        self.inner
            .send_message_and_wait_for_response(
                endpoint,
                message,
                retry_count,
                self.inner.wait_for_response,
            )
            .await
    }

    /// Ping an endpoint and return whatever custom data it answered with.
    pub async fn verify_connection(
        &self,
        endpoint: &EndpointId,
        timeout: Duration,
    ) -> WireResult<Option<serde_json::Value>> {
        let custom_data = self.inner.monitor.request_data();
        self.inner.verify_connection(endpoint, timeout, custom_data).await
    }

    /// Push the file at `path` to `endpoint` as the answer to `responding_to`.
    pub async fn upload_data(
        &self,
        endpoint: &EndpointId,
        path: &Path,
        responding_to: MessageId,
        cancel: CancellationToken,
        retry_count: u32,
    ) -> WireResult<()> {
        self.inner
            .upload_data(endpoint, path, responding_to, cancel, retry_count)
            .await
    }

    /// Ask `endpoint` for a stream and store it at `path`.
    ///
    /// Resolves with `path` once the stream is written. A refusal from the
    /// remote fails with [`WireError::UnexpectedResponse`].
    pub async fn download_data(
        &self,
        endpoint: &EndpointId,
        payload: serde_json::Value,
        path: PathBuf,
        timeout: Duration,
    ) -> WireResult<PathBuf> {
        self.inner.download_data(endpoint, payload, path, timeout).await
    }

    /// Run `action` for every inbound message `filter` accepts.
    pub fn register_message_action(&self, filter: MessageFilter, action: MessageAction) {
        self.inner.messages.register_action(filter, action);
    }

    pub fn register_action_for(&self, message_type: MessageType, action: MessageAction) {
        self.inner.messages.register_for(message_type, action);
    }

    /// Decide which file answers a download request.
    pub fn register_upload_source(&self, source: UploadSource) {
        *self
            .inner
            .upload_source
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(source);
    }

    pub fn register_approver(&self, approver: Arc<dyn ApproveEndpointConnections>) {
        self.inner.conductor.register_approver(approver);
    }

    pub fn set_keep_alive_request_data(&self, builder: KeepAliveDataBuilder) {
        self.inner.monitor.set_request_data_builder(builder);
    }

    pub fn set_keep_alive_response_data(&self, builder: KeepAliveDataBuilder) {
        self.inner.monitor.set_response_data_builder(builder);
    }
}

struct LayerInner {
    id: EndpointId,
    self_ref: Weak<LayerInner>,
    state: Mutex<LayerState>,
    /// Serializes sign-in and sign-out.
    lifecycle: tokio::sync::Mutex<()>,
    /// Serializes opening channels on demand.
    open_lock: tokio::sync::Mutex<()>,
    transports: HashMap<ChannelTemplate, Arc<dyn ChannelTransport>>,
    template_order: Vec<ChannelTemplate>,
    channels: DashMap<ChannelTemplate, Arc<ProtocolChannel>>,
    channel_tasks: Mutex<Vec<JoinHandle<()>>>,
    sink: Arc<dyn InboundSink>,
    directory: Arc<EndpointDirectory>,
    messages: MessageHandler,
    data: DataHandler,
    conductor: Arc<HandshakeConductor>,
    monitor: Arc<ConnectionMonitor>,
    discovery: Vec<Arc<dyn DiscoverySource>>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
    announcement: watch::Sender<DiscoveredEndpoint>,
    upload_source: RwLock<Option<UploadSource>>,
    events: broadcast::Sender<ProtocolEvent>,
    wait_for_response: Duration,
}

impl LayerInner {
    fn state(&self) -> LayerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: LayerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        debug!(endpoint = %self.id, state = %state, "Protocol layer state changed");
    }

    fn ensure_active(&self) -> WireResult<()> {
        match self.state() {
            LayerState::SignedOut => Err(WireError::ShuttingDown),
            _ => Ok(()),
        }
    }

    fn emit(&self, event: ProtocolEvent) {
        let _ = self.events.send(event);
    }

    async fn sign_in(self: &Arc<Self>) -> WireResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != LayerState::SignedOut {
            debug!(endpoint = %self.id, "Already signed in");
            return Ok(());
        }
        self.set_state(LayerState::SigningIn);

        for template in self.template_order.clone() {
            if let Err(e) = self.channel_for(template).await {
                error!(
                    endpoint = %self.id,
                    template = %template,
                    error = %e,
                    "Cannot open channel"
                );
                self.close_channels().await;
                self.set_state(LayerState::SignedOut);
                return Err(e);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for source in &self.discovery {
            if let Err(e) = source.start(self.announcement.subscribe(), tx.clone()).await {
                error!(source = source.name(), error = %e, "Cannot start discovery source");
                self.stop_discovery().await;
                self.close_channels().await;
                self.set_state(LayerState::SignedOut);
                return Err(e);
            }
        }
        let task = tokio::spawn(consume_discovery(Arc::downgrade(self), rx));
        *self.discovery_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        self.monitor.start();
        self.set_state(LayerState::SignedIn);
        info!(
            endpoint = %self.id,
            channels = self.channels.len(),
            discovery_sources = self.discovery.len(),
            "Signed in"
        );
        self.emit(ProtocolEvent::SignedIn);
        Ok(())
    }

    async fn sign_out(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != LayerState::SignedIn {
            debug!(endpoint = %self.id, "Not signed in");
            return;
        }
        self.set_state(LayerState::SigningOut);

        self.stop_discovery().await;
        self.monitor.stop();

        let connected = self.directory.known_endpoints();
        let goodbyes = connected.iter().map(|remote| async move {
            let goodbye = ProtocolMessage::new(self.id.clone(), MessageKind::EndpointDisconnect);
            match tokio::time::timeout(
                DISCONNECT_NOTICE_TIMEOUT,
                self.send_message_to(remote, goodbye, 0),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(endpoint = %remote, error = %e, "Goodbye not delivered"),
                Err(_) => debug!(endpoint = %remote, "Goodbye timed out"),
            }
        });
        futures::future::join_all(goodbyes).await;

        let removed = self.directory.clear();
        self.messages.on_local_channel_closed();
        self.data.on_local_channel_closed();
        self.close_channels().await;

        self.set_state(LayerState::SignedOut);
        info!(endpoint = %self.id, disconnected = removed.len(), "Signed out");
        self.emit(ProtocolEvent::SignedOut);
    }

    async fn stop_discovery(&self) {
        for source in &self.discovery {
            source.stop().await;
        }
        if let Some(task) = self
            .discovery_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    async fn close_channels(&self) {
        for task in self
            .channel_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        let channels: Vec<Arc<ProtocolChannel>> =
            self.channels.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.channels.clear();
        for channel in channels {
            channel.close_channel().await;
        }
        self.refresh_announcement();
    }

    /// The open channel for `template`, opening it first if needed.
    async fn channel_for(&self, template: ChannelTemplate) -> WireResult<Arc<ProtocolChannel>> {
        if let Some(channel) = self.channels.get(&template) {
            return Ok(Arc::clone(channel.value()));
        }
        let _open = self.open_lock.lock().await;
        if let Some(channel) = self.channels.get(&template) {
            return Ok(Arc::clone(channel.value()));
        }

        let template = template.ensure_usable()?;
        let transport = self
            .transports
            .get(&template)
            .ok_or(WireError::UnsupportedChannelTemplate(template))?;
        let this = self.self_ref.upgrade().ok_or(WireError::ShuttingDown)?;

        let channel =
            ProtocolChannel::new(self.id.clone(), Arc::clone(transport), Arc::clone(&self.sink));
        channel.open_channel().await?;
        let task = tokio::spawn(forward_channel_events(Arc::downgrade(&this), channel.subscribe()));
        self.channel_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
        self.channels.insert(template, Arc::clone(&channel));
        self.refresh_announcement();
        Ok(channel)
    }

    /// Republish the protocols this endpoint offers to discovery.
    fn refresh_announcement(&self) {
        let protocols: Vec<ProtocolInformation> = self
            .template_order
            .iter()
            .filter_map(|template| self.channels.get(template))
            .filter_map(|channel| channel.local_information())
            .collect();
        let discovery = self
            .template_order
            .first()
            .and_then(|template| self.channels.get(template))
            .and_then(|channel| {
                let local = channel.local_information()?;
                channel
                    .transport()
                    .bound_discovery_address(&local.message_address)
                    .ok()
            });
        self.announcement.send_modify(|local| {
            local.protocols = protocols;
            if let Some(address) = discovery {
                local.discovery.address = address;
            }
        });
    }

    fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::AddressChanged(info) => {
                info!(
                    endpoint = %self.id,
                    messages = %info.message_address,
                    "Local channel address changed"
                );
                self.refresh_announcement();
            }
            ChannelEvent::Failed { template, reason } => {
                error!(
                    endpoint = %self.id,
                    template = %template,
                    reason = %reason,
                    "Channel failed permanently"
                );
                self.emit(ProtocolEvent::ChannelFailed { template, reason });
            }
            ChannelEvent::Closed(template) => {
                debug!(endpoint = %self.id, template = %template, "Channel closed");
            }
        }
    }

    fn on_directory_event(&self, event: &DirectoryEvent) {
        match event {
            DirectoryEvent::Connected(info) => {
                info!(endpoint = %info.id, "Endpoint connected");
                self.monitor.register(info.id.clone());
                self.emit(ProtocolEvent::EndpointConnected(info.clone()));
            }
            DirectoryEvent::Disconnecting(info) => {
                info!(endpoint = %info.id, "Endpoint disconnected");
                self.monitor.unregister(&info.id);
                self.messages.on_endpoint_signed_off(&info.id);
                self.data.on_endpoint_signed_off(&info.id);
                if let Some(channel) = self.channels.get(&info.protocol.channel_template()) {
                    let channel = Arc::clone(channel.value());
                    let remote = info.protocol.clone();
                    tokio::spawn(async move { channel.endpoint_disconnected(&remote).await });
                }
                self.emit(ProtocolEvent::EndpointDisconnected(info.id.clone()));
            }
        }
    }

    fn watch_directory(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        this.directory.add_listener(Arc::new(move |event: &DirectoryEvent| {
            if let Some(layer) = weak.upgrade() {
                layer.on_directory_event(event);
            }
        }));
    }

    /// Actions the layer itself answers: keep-alive pings, download
    /// requests and anything nobody else claimed.
    fn register_actions(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        let on_verification: MessageAction = Arc::new(move |msg| {
            let weak = weak.clone();
            async move {
                let Some(layer) = weak.upgrade() else {
                    return;
                };
                let reply = ProtocolMessage::new(
                    layer.id.clone(),
                    MessageKind::ConnectionVerificationResponse {
                        responding_to: msg.id,
                        custom_data: layer.monitor.response_data(),
                    },
                );
                if let Err(e) = layer.send_message_to(&msg.sender, reply, 0).await {
                    debug!(endpoint = %msg.sender, error = %e, "Verification reply not sent");
                }
            }
            .boxed()
        });
        this.messages
            .register_for(MessageType::ConnectionVerification, on_verification);

        let weak = Arc::downgrade(this);
        let on_download: MessageAction = Arc::new(move |msg| {
            let weak = weak.clone();
            async move {
                if let Some(layer) = weak.upgrade() {
                    layer.answer_download_request(msg).await;
                }
            }
            .boxed()
        });
        this.messages
            .register_for(MessageType::DataDownloadRequest, on_download);

        let weak = Arc::downgrade(this);
        let last_chance: MessageAction = Arc::new(move |msg| {
            let weak = weak.clone();
            async move {
                let Some(layer) = weak.upgrade() else {
                    return;
                };
                // Unclaimed replies are late or unsolicited. Never answer them.
                if !msg.responding_to().is_none() {
                    debug!(
                        endpoint = %msg.sender,
                        message_type = ?msg.message_type(),
                        "Dropping unmatched reply"
                    );
                    return;
                }
                warn!(
                    endpoint = %msg.sender,
                    message_type = ?msg.message_type(),
                    "No handler for message"
                );
                let reply = ProtocolMessage::new(
                    layer.id.clone(),
                    MessageKind::UnknownMessageType { responding_to: msg.id },
                );
                if let Err(e) = layer.send_message_to(&msg.sender, reply, 0).await {
                    debug!(endpoint = %msg.sender, error = %e, "Unknown-type reply not sent");
                }
            }
            .boxed()
        });
        this.messages.set_last_chance_action(last_chance);
    }

    async fn answer_download_request(&self, request: ProtocolMessage) {
        let MessageKind::DataDownloadRequest { payload } = request.kind else {
            return;
        };
        let source = self
            .upload_source
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let outcome = match source {
            Some(source) => match source(request.sender.clone(), payload).await {
                Ok(path) => {
                    let cancel = CancellationToken::new();
                    self.upload_data(&request.sender, &path, request.id, cancel, 1).await
                }
                Err(e) => Err(e),
            },
            None => Err(WireError::UnexpectedResponse("no upload source registered".to_string())),
        };
        if let Err(e) = outcome {
            info!(endpoint = %request.sender, error = %e, "Download request refused");
            let refusal = ProtocolMessage::new(
                self.id.clone(),
                MessageKind::Failure {
                    responding_to: request.id,
                },
            );
            if let Err(e) = self.send_message_to(&request.sender, refusal, 0).await {
                debug!(endpoint = %request.sender, error = %e, "Refusal not sent");
            }
        }
    }

    /// Contact information for an endpoint the layer may talk to.
    fn contact(&self, endpoint: &EndpointId) -> WireResult<EndpointInformation> {
        self.ensure_active()?;
        self.directory
            .contact_information_for(endpoint)
            .ok_or_else(|| WireError::EndpointNotContactable(endpoint.clone()))
    }

    async fn upload_data(
        &self,
        endpoint: &EndpointId,
        path: &Path,
        responding_to: MessageId,
        cancel: CancellationToken,
        retry_count: u32,
    ) -> WireResult<()> {
        let remote = self.contact(endpoint)?;
        let channel = self.channel_for(remote.protocol.channel_template()).await?;
        channel
            .transfer_data(&remote.protocol, endpoint, responding_to, path, cancel, retry_count)
            .await?;
        self.monitor.on_outbound_integrity_confirmed(endpoint);
        Ok(())
    }

    async fn download_data(
        &self,
        endpoint: &EndpointId,
        payload: serde_json::Value,
        path: PathBuf,
        timeout: Duration,
    ) -> WireResult<PathBuf> {
        self.contact(endpoint)?;
        let request =
            ProtocolMessage::new(self.id.clone(), MessageKind::DataDownloadRequest { payload });
        let request_id = request.id;

        let stream = self.data.forward_data(endpoint.clone(), request_id, path, timeout);
        let refusal = self.messages.forward_response(endpoint.clone(), request_id, timeout);
        if let Err(e) = self.send_message_to(endpoint, request, 1).await {
            self.data.cancel_data(endpoint, request_id);
            self.messages.cancel_response(endpoint, request_id);
            return Err(e);
        }

        tokio::select! {
            written = stream => {
                self.messages.cancel_response(endpoint, request_id);
                written
            }
            reply = refusal => {
                self.data.cancel_data(endpoint, request_id);
                let reply = reply?;
                Err(WireError::UnexpectedResponse(format!(
                    "{:?} to download request",
                    reply.message_type()
                )))
            }
        }
    }
}

#[async_trait]
impl ProtocolMessenger for LayerInner {
    fn local_endpoint(&self) -> EndpointId {
        self.id.clone()
    }

    fn supports_template(&self, template: ChannelTemplate) -> bool {
        self.transports.contains_key(&template)
    }

    async fn local_information_for(
        &self,
        template: ChannelTemplate,
    ) -> WireResult<EndpointInformation> {
        let channel = self.channel_for(template).await?;
        let protocol = channel
            .local_information()
            .ok_or(WireError::ChannelNotOpen(template))?;
        let discovery = DiscoveryInformation::new(
            PROTOCOL_VERSION,
            channel
                .transport()
                .bound_discovery_address(&protocol.message_address)?,
        );
        Ok(EndpointInformation::new(self.id.clone(), discovery, protocol))
    }

    async fn send_message_to(
        &self,
        endpoint: &EndpointId,
        message: ProtocolMessage,
        retry_count: u32,
    ) -> WireResult<()> {
        let remote = self.contact(endpoint)?;
        let channel = self.channel_for(remote.protocol.channel_template()).await?;
        // A written ping proves nothing until its answer comes back.
        let confirms = !matches!(message.kind, MessageKind::ConnectionVerification { .. });
        channel.send(&remote.protocol, &message, retry_count).await?;
        if confirms {
            self.monitor.on_outbound_integrity_confirmed(endpoint);
        }
        Ok(())
    }

    async fn send_message_and_wait_for_response(
        &self,
        endpoint: &EndpointId,
        message: ProtocolMessage,
        retry_count: u32,
        timeout: Duration,
    ) -> WireResult<ProtocolMessage> {
        self.contact(endpoint)?;
        let message_id = message.id;
        let reply = self.messages.forward_response(endpoint.clone(), message_id, timeout);
        if let Err(e) = self.send_message_to(endpoint, message, retry_count).await {
            self.messages.cancel_response(endpoint, message_id);
            return Err(e);
        }
        reply.await
    }
}

/// Routes frames from every channel into the layer.
struct LayerSink(Weak<LayerInner>);

#[async_trait]
impl InboundSink for LayerSink {
    async fn receive(&self, frame: Frame) {
        let Some(layer) = self.0.upgrade() else {
            return;
        };
        match frame {
            Frame::Message(message) => {
                layer.monitor.on_inbound_integrity_confirmed(&message.sender);
                layer.messages.process_message(message);
            }
            Frame::Data(transfer) => {
                layer.monitor.on_inbound_integrity_confirmed(&transfer.sender);
                layer.data.process_data(transfer).await;
            }
        }
    }
}

async fn forward_channel_events(
    layer: Weak<LayerInner>,
    mut events: broadcast::Receiver<ChannelEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(layer) = layer.upgrade() else {
            return;
        };
        layer.on_channel_event(event);
    }
}

async fn consume_discovery(
    layer: Weak<LayerInner>,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(layer) = layer.upgrade() else {
            return;
        };
        match event {
            DiscoveryEvent::Available(endpoint) => {
                let Some(protocol) =
                    select_protocol(&endpoint.protocols, &[PROTOCOL_VERSION], &layer.template_order)
                else {
                    debug!(endpoint = %endpoint.id, "No compatible protocol offered");
                    continue;
                };
                let remote = EndpointInformation::new(endpoint.id, endpoint.discovery, protocol);
                let conductor = Arc::clone(&layer.conductor);
                tokio::spawn(async move {
                    let id = remote.id.clone();
                    if let Err(e) = conductor.on_endpoint_becoming_available(remote).await {
                        warn!(endpoint = %id, error = %e, "Handshake failed");
                    }
                });
            }
            DiscoveryEvent::Unavailable(id) => {
                layer.conductor.on_endpoint_becoming_unavailable(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpSettings;
    use crate::transport::FrameLimits;

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

    fn layer(machine: &str) -> ProtocolLayer {
        ProtocolLayer::builder(ProtocolConfig::default())
            .endpoint_id(EndpointId::new(machine, 1))
            .subject(CommunicationSubject::new("test"))
            .transport(tcp())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sign_in_twice_opens_once() {
        let layer = layer("alpha");
        let mut events = layer.events();

        layer.sign_in().await.unwrap();
        let first = layer.local_information(ChannelTemplate::TcpIP).unwrap();
        layer.sign_in().await.unwrap();
        let second = layer.local_information(ChannelTemplate::TcpIP).unwrap();

        assert_eq!(first, second);
        assert_eq!(events.recv().await.unwrap(), ProtocolEvent::SignedIn);
        assert!(events.try_recv().is_err());
        let local = layer.local_endpoint();
        assert_eq!(local.discovery.address.port(), first.message_address.port());
        assert_ne!(local.discovery.address.port(), Some(0));
        assert_eq!(local.protocols, vec![first]);
        layer.sign_out().await;
    }

    #[tokio::test]
    async fn test_sign_out_without_sign_in_is_noop() {
        let layer = layer("alpha");
        let mut events = layer.events();
        layer.sign_out().await;
        assert_eq!(layer.state(), LayerState::SignedOut);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sign_out_closes_channels() {
        let layer = layer("alpha");
        layer.sign_in().await.unwrap();
        assert!(layer.is_signed_in());

        layer.sign_out().await;
        assert_eq!(layer.state(), LayerState::SignedOut);
        assert!(layer.local_information(ChannelTemplate::TcpIP).is_none());
        assert!(layer.local_endpoint().protocols.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_not_contactable() {
        let layer = layer("alpha");
        layer.sign_in().await.unwrap();
        let stranger = EndpointId::new("stranger", 9);
        let message = ProtocolMessage::new(layer.id().clone(), MessageKind::EndpointDisconnect);

        let err = layer.send_message_to(&stranger, message, 0).await.unwrap_err();
        assert!(matches!(err, WireError::EndpointNotContactable(id) if id == stranger));
        layer.sign_out().await;
    }

    #[tokio::test]
    async fn test_http_transport_rejected() {
        struct HttpTransport;

        #[async_trait]
        impl ChannelTransport for HttpTransport {
            fn template(&self) -> ChannelTemplate {
                ChannelTemplate::Http
            }
            fn generate_new_channel_uri(
                &self,
                _purpose: crate::transport::ChannelPurpose,
            ) -> WireResult<url::Url> {
                Ok("http://h/protocol".parse().unwrap())
            }
            fn discovery_address(&self) -> WireResult<url::Url> {
                Ok("http://h/discovery".parse().unwrap())
            }
            async fn listen(
                &self,
                _address: url::Url,
                _sink: Arc<dyn InboundSink>,
                _events: mpsc::UnboundedSender<crate::transport::HostEvent>,
            ) -> WireResult<crate::transport::ListenerHandle> {
                Err(WireError::UnsupportedChannelTemplate(ChannelTemplate::Http))
            }
            async fn connect(
                &self,
                _address: &url::Url,
            ) -> WireResult<Box<dyn crate::transport::FrameSender>> {
                Err(WireError::UnsupportedChannelTemplate(ChannelTemplate::Http))
            }
        }

        let result = ProtocolLayer::builder(ProtocolConfig::default())
            .transport(Arc::new(HttpTransport))
            .build();
        assert!(matches!(
            result,
            Err(WireError::UnsupportedChannelTemplate(ChannelTemplate::Http))
        ));
    }
}
