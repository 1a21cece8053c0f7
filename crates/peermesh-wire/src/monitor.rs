//! Connection monitor: keep-alive verification of connected endpoints.
//!
//! Every registered endpoint has a next-check time. Any traffic in either
//! direction pushes it one keep-alive interval into the future. On each
//! timer tick, endpoints whose check time has passed are pinged with a
//! `ConnectionVerification`. An endpoint that misses more than the allowed
//! number of consecutive checks is removed from the directory.

use crate::directory::EndpointDirectory;
use crate::messenger::ProtocolMessenger;
use futures::future::join_all;
use peermesh_types::config::ProtocolConfig;
use peermesh_types::EndpointId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Supplies custom data for keep-alive messages.
pub type KeepAliveDataBuilder = Arc<dyn Fn() -> Option<serde_json::Value> + Send + Sync>;

/// Per-endpoint keep-alive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionMap {
    pub next_check_time: Instant,
    pub missed_signal_count: u32,
}

/// Keep-alive timing.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Quiet time after which an endpoint is pinged.
    pub keep_alive_interval: Duration,
    /// How often the timer looks for due endpoints.
    pub check_period: Duration,
    /// Consecutive misses tolerated before disconnecting.
    pub max_missed_signals: u32,
    /// How long one ping may take.
    pub verification_timeout: Duration,
}

impl MonitorConfig {
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self {
            keep_alive_interval: config.keep_alive_interval,
            check_period: config.keep_alive_check_period,
            max_missed_signals: config.max_missed_keep_alive_signals,
            verification_timeout: config.wait_for_response.min(config.keep_alive_interval),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub verified: Vec<EndpointId>,
    pub missed: Vec<EndpointId>,
    pub disconnected: Vec<EndpointId>,
    /// `true` if another tick was still running and this one did nothing.
    pub skipped: bool,
}

pub struct ConnectionMonitor {
    messenger: Weak<dyn ProtocolMessenger>,
    directory: Arc<EndpointDirectory>,
    config: MonitorConfig,
    connections: Mutex<HashMap<EndpointId, ConnectionMap>>,
    tick_guard: tokio::sync::Mutex<()>,
    request_data: RwLock<Option<KeepAliveDataBuilder>>,
    response_data: RwLock<Option<KeepAliveDataBuilder>>,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectionMonitor {
    pub fn new(
        messenger: Weak<dyn ProtocolMessenger>,
        directory: Arc<EndpointDirectory>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            messenger,
            directory,
            config,
            connections: Mutex::new(HashMap::new()),
            tick_guard: tokio::sync::Mutex::new(()),
            request_data: RwLock::new(None),
            response_data: RwLock::new(None),
            timer: Mutex::new(None),
        }
    }

    /// Start watching an endpoint.
    pub fn register(&self, id: EndpointId) {
        let next_check_time = Instant::now() + self.config.keep_alive_interval;
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                ConnectionMap {
                    next_check_time,
                    missed_signal_count: 0,
                },
            );
    }

    pub fn unregister(&self, id: &EndpointId) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn is_monitored(&self, id: &EndpointId) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn connection(&self, id: &EndpointId) -> Option<ConnectionMap> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }

    /// Traffic arrived from `id`.
    pub fn on_inbound_integrity_confirmed(&self, id: &EndpointId) {
        self.confirm(id);
    }

    /// Traffic was delivered to `id`.
    pub fn on_outbound_integrity_confirmed(&self, id: &EndpointId) {
        self.confirm(id);
    }

    fn confirm(&self, id: &EndpointId) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = connections.get_mut(id) {
            entry.next_check_time = Instant::now() + self.config.keep_alive_interval;
            entry.missed_signal_count = 0;
        }
    }

    /// Data attached to outgoing pings.
    pub fn set_request_data_builder(&self, builder: KeepAliveDataBuilder) {
        *self.request_data.write().unwrap_or_else(|e| e.into_inner()) = Some(builder);
    }

    /// Data attached to answers to remote pings.
    pub fn set_response_data_builder(&self, builder: KeepAliveDataBuilder) {
        *self.response_data.write().unwrap_or_else(|e| e.into_inner()) = Some(builder);
    }

    pub fn request_data(&self) -> Option<serde_json::Value> {
        let builder = self.request_data.read().unwrap_or_else(|e| e.into_inner()).clone();
        builder.and_then(|b| b())
    }

    pub fn response_data(&self) -> Option<serde_json::Value> {
        let builder = self.response_data.read().unwrap_or_else(|e| e.into_inner()).clone();
        builder.and_then(|b| b())
    }

    /// Ping every endpoint whose check time has passed.
    ///
    /// Does nothing if the previous check is still running.
    pub async fn check_connections(&self) -> CheckReport {
        let Ok(_running) = self.tick_guard.try_lock() else {
            debug!("Previous keep-alive check still running, skipping tick");
            return CheckReport {
                skipped: true,
                ..CheckReport::default()
            };
        };
        let Some(messenger) = self.messenger.upgrade() else {
            return CheckReport::default();
        };

        let now = Instant::now();
        let due: Vec<EndpointId> = {
            let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections
                .iter()
                .filter(|(_, c)| c.next_check_time <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };
        if due.is_empty() {
            return CheckReport::default();
        }

        let custom = self.request_data();
        let timeout = self.config.verification_timeout;
        let results = join_all(due.iter().map(|id| {
            let messenger = Arc::clone(&messenger);
            let custom = custom.clone();
            async move { messenger.verify_connection(id, timeout, custom).await }
        }))
        .await;

        let mut report = CheckReport::default();
        let finished = Instant::now();
        {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            for (id, result) in due.into_iter().zip(results) {
                // Unregistered while the ping was out.
                let Some(entry) = connections.get_mut(&id) else {
                    continue;
                };
                match result {
                    Ok(_) => {
                        entry.next_check_time = finished + self.config.keep_alive_interval;
                        entry.missed_signal_count = 0;
                        report.verified.push(id);
                    }
                    Err(e) => {
                        entry.missed_signal_count += 1;
                        debug!(
                            endpoint = %id,
                            missed = entry.missed_signal_count,
                            error = %e,
                            "Keep-alive check missed"
                        );
                        if entry.missed_signal_count > self.config.max_missed_signals {
                            connections.remove(&id);
                            report.disconnected.push(id);
                        } else {
                            entry.next_check_time = finished;
                            report.missed.push(id);
                        }
                    }
                }
            }
        }

        // Directory listeners run outside the monitor's lock.
        for id in &report.disconnected {
            warn!(endpoint = %id, "Endpoint missed too many keep-alive checks, disconnecting");
            self.directory.try_remove_endpoint(id);
        }
        report
    }

    /// Run [`check_connections`](Self::check_connections) on a timer.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let weak = Arc::downgrade(self);
        let period = self.config.check_period;
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                // Ticks run on their own task so a slow check never blocks
                // the timer; overlapping ticks skip themselves.
                tokio::spawn(async move {
                    monitor.check_connections().await;
                });
            }
        });
        *timer = Some((cancel, task));
        info!(period = ?period, "Connection monitor started");
    }

    /// Stop the timer and forget every endpoint.
    pub fn stop(&self) {
        let timer = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, task)) = timer {
            cancel.cancel();
            task.abort();
        }
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{WireError, WireResult};
    use crate::message::{MessageKind, ProtocolMessage, PROTOCOL_VERSION};
    use async_trait::async_trait;
    use peermesh_types::{
        ChannelTemplate, DiscoveryInformation, EndpointInformation, ProtocolInformation,
    };
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const INTERVAL: Duration = Duration::from_secs(60);

    /// Answers pings unless the endpoint is marked dead.
    #[derive(Default)]
    struct PingMessenger {
        pings: AtomicUsize,
        dead: Mutex<HashSet<EndpointId>>,
        gate: Option<Arc<Notify>>,
        last_custom: Mutex<Option<serde_json::Value>>,
    }

    #[async_trait]
    impl ProtocolMessenger for PingMessenger {
        fn local_endpoint(&self) -> EndpointId {
            EndpointId::new("local", 1)
        }

        fn supports_template(&self, _template: ChannelTemplate) -> bool {
            true
        }

        async fn local_information_for(
            &self,
            _template: ChannelTemplate,
        ) -> WireResult<EndpointInformation> {
            Err(WireError::ShuttingDown)
        }

        async fn send_message_to(
            &self,
            _endpoint: &EndpointId,
            _message: ProtocolMessage,
            _retry_count: u32,
        ) -> WireResult<()> {
            Ok(())
        }

        async fn send_message_and_wait_for_response(
            &self,
            endpoint: &EndpointId,
            message: ProtocolMessage,
            _retry_count: u32,
            timeout: Duration,
        ) -> WireResult<ProtocolMessage> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if let MessageKind::ConnectionVerification { custom_data } = &message.kind {
                *self.last_custom.lock().unwrap() = custom_data.clone();
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.dead.lock().unwrap().contains(endpoint) {
                return Err(WireError::Timeout(timeout));
            }
            Ok(ProtocolMessage::new(
                endpoint.clone(),
                MessageKind::ConnectionVerificationResponse {
                    responding_to: message.id,
                    custom_data: None,
                },
            ))
        }
    }

    fn monitor_with(
        messenger: &Arc<PingMessenger>,
        directory: Arc<EndpointDirectory>,
    ) -> Arc<ConnectionMonitor> {
        let as_dyn: Arc<dyn ProtocolMessenger> = messenger.clone();
        Arc::new(ConnectionMonitor::new(
            Arc::downgrade(&as_dyn),
            directory,
            MonitorConfig {
                keep_alive_interval: INTERVAL,
                check_period: Duration::from_secs(20),
                max_missed_signals: 2,
                verification_timeout: Duration::from_secs(5),
            },
        ))
    }

    fn connected(directory: &EndpointDirectory, id: &EndpointId) {
        directory.try_add(EndpointInformation::new(
            id.clone(),
            DiscoveryInformation::new(PROTOCOL_VERSION, "net.tcp://h:1/discovery".parse().unwrap()),
            ProtocolInformation::new(
                PROTOCOL_VERSION,
                "net.tcp://h:1/protocol/messages/m".parse().unwrap(),
                None,
            ),
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_ping() {
        let messenger = Arc::new(PingMessenger::default());
        let monitor = monitor_with(&messenger, Arc::new(EndpointDirectory::new()));
        let peer = EndpointId::new("peer", 1);
        monitor.register(peer.clone());

        tokio::time::advance(INTERVAL - Duration::from_secs(1)).await;
        monitor.on_inbound_integrity_confirmed(&peer);
        tokio::time::advance(Duration::from_secs(2)).await;

        let report = monitor.check_connections().await;
        assert!(report.verified.is_empty());
        assert_eq!(messenger.pings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_pinged_once_per_interval() {
        let messenger = Arc::new(PingMessenger::default());
        let monitor = monitor_with(&messenger, Arc::new(EndpointDirectory::new()));
        let peer = EndpointId::new("peer", 1);
        monitor.register(peer.clone());

        tokio::time::advance(INTERVAL).await;
        assert_eq!(monitor.check_connections().await.verified, vec![peer.clone()]);
        // Checking again right away finds nothing due.
        assert!(monitor.check_connections().await.verified.is_empty());
        assert_eq!(messenger.pings.load(Ordering::SeqCst), 1);

        tokio::time::advance(INTERVAL).await;
        monitor.check_connections().await;
        assert_eq!(messenger.pings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_misses_disconnects() {
        let messenger = Arc::new(PingMessenger::default());
        let peer = EndpointId::new("peer", 1);
        messenger.dead.lock().unwrap().insert(peer.clone());
        let directory = Arc::new(EndpointDirectory::new());
        connected(&directory, &peer);
        let monitor = monitor_with(&messenger, Arc::clone(&directory));
        monitor.register(peer.clone());

        tokio::time::advance(INTERVAL).await;
        assert_eq!(monitor.check_connections().await.missed, vec![peer.clone()]);
        assert_eq!(monitor.connection(&peer).unwrap().missed_signal_count, 1);
        assert_eq!(monitor.check_connections().await.missed, vec![peer.clone()]);
        let report = monitor.check_connections().await;
        assert_eq!(report.disconnected, vec![peer.clone()]);

        assert!(!monitor.is_monitored(&peer));
        assert!(!directory.can_communicate_with_endpoint(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_missed_count() {
        let messenger = Arc::new(PingMessenger::default());
        let peer = EndpointId::new("peer", 1);
        messenger.dead.lock().unwrap().insert(peer.clone());
        let monitor = monitor_with(&messenger, Arc::new(EndpointDirectory::new()));
        monitor.register(peer.clone());

        tokio::time::advance(INTERVAL).await;
        monitor.check_connections().await;
        messenger.dead.lock().unwrap().clear();
        monitor.check_connections().await;
        assert_eq!(monitor.connection(&peer).unwrap().missed_signal_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_tick_is_skipped() {
        let gate = Arc::new(Notify::new());
        let messenger = Arc::new(PingMessenger {
            gate: Some(Arc::clone(&gate)),
            ..PingMessenger::default()
        });
        let monitor = monitor_with(&messenger, Arc::new(EndpointDirectory::new()));
        monitor.register(EndpointId::new("peer", 1));
        tokio::time::advance(INTERVAL).await;

        let first = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.check_connections().await })
        };
        while messenger.pings.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(monitor.check_connections().await.skipped);

        gate.notify_one();
        assert_eq!(first.await.unwrap().verified.len(), 1);
        assert_eq!(messenger.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_request_data() {
        let messenger = Arc::new(PingMessenger::default());
        let monitor = monitor_with(&messenger, Arc::new(EndpointDirectory::new()));
        monitor.set_request_data_builder(Arc::new(|| Some(serde_json::json!({"load": 1}))));
        monitor.set_response_data_builder(Arc::new(|| Some(serde_json::json!("pong"))));
        monitor.register(EndpointId::new("peer", 1));

        tokio::time::advance(INTERVAL).await;
        monitor.check_connections().await;
        assert_eq!(
            *messenger.last_custom.lock().unwrap(),
            Some(serde_json::json!({"load": 1}))
        );
        assert_eq!(monitor.response_data(), Some(serde_json::json!("pong")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_pings_idle_endpoint() {
        let messenger = Arc::new(PingMessenger::default());
        let monitor = monitor_with(&messenger, Arc::new(EndpointDirectory::new()));
        monitor.register(EndpointId::new("peer", 1));
        monitor.start();

        tokio::time::sleep(INTERVAL + Duration::from_secs(25)).await;
        assert_eq!(messenger.pings.load(Ordering::SeqCst), 1);

        monitor.stop();
        assert!(!monitor.is_monitored(&EndpointId::new("peer", 1)));
    }
}
