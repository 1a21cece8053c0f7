//! Channel host: keeps one listening channel alive.
//!
//! The host owns a single listener for one transport. When the listener
//! faults or closes on its own, the host reopens it on a fresh address.
//! Reopens are rate limited: more than [`MAX_FAULTS`] faults within
//! [`FAULT_WINDOW`] trips the breaker, after which the channel stays down and
//! [`HostNotice::Failed`] is broadcast.

use crate::error::{WireError, WireResult};
use crate::transport::{ChannelPurpose, ChannelTransport, HostEvent, InboundSink, ListenerHandle};
use peermesh_types::ChannelTemplate;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// Faults tolerated inside one window.
pub const MAX_FAULTS: usize = 10;
/// Length of the sliding fault window.
pub const FAULT_WINDOW: Duration = Duration::from_secs(60);

/// Sliding window of recent fault times.
#[derive(Debug)]
pub struct FaultWindow {
    max_faults: usize,
    window: Duration,
    faults: VecDeque<Instant>,
}

impl FaultWindow {
    pub fn new(max_faults: usize, window: Duration) -> Self {
        Self {
            max_faults,
            window,
            faults: VecDeque::with_capacity(max_faults + 1),
        }
    }

    /// Record a fault at `now`. Fails once more than `max_faults` faults
    /// fall inside the window ending at `now`.
    pub fn record(&mut self, now: Instant) -> WireResult<()> {
        self.faults.push_back(now);
        while let Some(oldest) = self.faults.front() {
            if now.duration_since(*oldest) > self.window
                || self.faults.len() > self.max_faults + 1
            {
                self.faults.pop_front();
            } else {
                break;
            }
        }
        if self.faults.len() > self.max_faults {
            return Err(WireError::MaximumChannelRestartsExceeded {
                faults: self.faults.len(),
                window: self.window,
            });
        }
        Ok(())
    }

    /// Faults currently inside the window.
    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }
}

impl Default for FaultWindow {
    fn default() -> Self {
        Self::new(MAX_FAULTS, FAULT_WINDOW)
    }
}

/// Broadcast when the host recovers or gives up.
#[derive(Debug, Clone, PartialEq)]
pub enum HostNotice {
    /// The listener was reopened on a new address.
    Reopened(Url),
    /// The breaker tripped; the channel is down for good.
    Failed(String),
}

struct HostState {
    listener: Option<ListenerHandle>,
    watcher: Option<JoinHandle<()>>,
    faults: FaultWindow,
}

struct HostInner {
    transport: Arc<dyn ChannelTransport>,
    purpose: ChannelPurpose,
    state: Mutex<HostState>,
    notices: broadcast::Sender<HostNotice>,
}

/// Fault-tolerant holder of one listening channel.
pub struct ChannelHost {
    inner: Arc<HostInner>,
}

impl ChannelHost {
    pub fn new(transport: Arc<dyn ChannelTransport>, purpose: ChannelPurpose) -> Self {
        Self::with_fault_window(transport, purpose, FaultWindow::default())
    }

    pub fn with_fault_window(
        transport: Arc<dyn ChannelTransport>,
        purpose: ChannelPurpose,
        faults: FaultWindow,
    ) -> Self {
        let (notices, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(HostInner {
                transport,
                purpose,
                state: Mutex::new(HostState {
                    listener: None,
                    watcher: None,
                    faults,
                }),
                notices,
            }),
        }
    }

    pub fn template(&self) -> ChannelTemplate {
        self.inner.transport.template()
    }

    /// Subscribe to reopen/failure notices.
    pub fn subscribe(&self) -> broadcast::Receiver<HostNotice> {
        self.inner.notices.subscribe()
    }

    /// Open the channel on a fresh address, replacing any open one, and
    /// return the address it listens on.
    pub async fn open_channel(&self, sink: Arc<dyn InboundSink>) -> WireResult<Url> {
        let mut state = self.inner.state.lock().await;
        teardown(&mut state).await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let listener = self.inner.listen(Arc::clone(&sink), events_tx.clone()).await?;
        let address = listener.address().clone();
        state.listener = Some(listener);
        state.watcher = Some(tokio::spawn(watch(
            Arc::downgrade(&self.inner),
            events_rx,
            events_tx,
            sink,
        )));
        info!(
            template = %self.template(),
            purpose = ?self.inner.purpose,
            address = %address,
            "Channel opened"
        );
        Ok(address)
    }

    /// Close the channel. Fault handling is detached first so the
    /// shutdown itself never triggers a reopen. Closing an already closed
    /// or failed host is fine.
    pub async fn close_connection(&self) {
        let mut state = self.inner.state.lock().await;
        if teardown(&mut state).await {
            debug!(template = %self.template(), purpose = ?self.inner.purpose, "Channel closed");
        }
    }

    /// The address the channel currently listens on.
    pub async fn current_address(&self) -> Option<Url> {
        let state = self.inner.state.lock().await;
        state.listener.as_ref().map(|l| l.address().clone())
    }

    pub async fn is_open(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.listener.as_ref().is_some_and(|l| !l.is_terminated())
    }
}

impl HostInner {
    async fn listen(
        &self,
        sink: Arc<dyn InboundSink>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> WireResult<ListenerHandle> {
        let address = self.transport.generate_new_channel_uri(self.purpose)?;
        self.transport.listen(address, sink, events).await
    }

    /// Record a fault and reopen. Listen failures count as further faults.
    async fn recover(
        &self,
        sink: &Arc<dyn InboundSink>,
        events: &mpsc::UnboundedSender<HostEvent>,
    ) -> WireResult<Url> {
        let mut state = self.state.lock().await;
        if let Some(old) = state.listener.take() {
            old.close().await;
        }
        loop {
            state.faults.record(Instant::now())?;
            match self.listen(Arc::clone(sink), events.clone()).await {
                Ok(listener) => {
                    let address = listener.address().clone();
                    state.listener = Some(listener);
                    return Ok(address);
                }
                Err(e) => {
                    warn!(
                        template = %self.transport.template(),
                        error = %e,
                        "Reopening channel failed"
                    );
                }
            }
        }
    }
}

/// Detach the watcher, then stop the listener. Returns whether anything
/// was open.
async fn teardown(state: &mut HostState) -> bool {
    if let Some(watcher) = state.watcher.take() {
        watcher.abort();
    }
    match state.listener.take() {
        Some(listener) => {
            listener.close().await;
            true
        }
        None => false,
    }
}

async fn watch(
    host: Weak<HostInner>,
    mut events: mpsc::UnboundedReceiver<HostEvent>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    sink: Arc<dyn InboundSink>,
) {
    while let Some(event) = events.recv().await {
        let Some(host) = host.upgrade() else {
            return;
        };
        warn!(
            template = %host.transport.template(),
            purpose = ?host.purpose,
            event = ?event,
            "Channel fault, reopening"
        );
        match host.recover(&sink, &events_tx).await {
            Ok(address) => {
                info!(address = %address, "Channel reopened");
                let _ = host.notices.send(HostNotice::Reopened(address));
            }
            Err(e) => {
                error!(
                    template = %host.transport.template(),
                    error = %e,
                    "Channel restart limit reached, giving up"
                );
                let _ = host.notices.send(HostNotice::Failed(e.to_string()));
                return;
            }
        }
    }
}
