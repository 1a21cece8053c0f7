//! Inbound message dispatch and response correlation.

use crate::directory::EndpointDirectory;
use crate::error::WireResult;
use crate::message::{MessageType, ProtocolMessage};
use crate::pending::PendingTable;
use futures::future::BoxFuture;
use peermesh_types::{EndpointId, MessageId};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

/// Decides whether an action wants a message.
pub type MessageFilter = Arc<dyn Fn(&ProtocolMessage) -> bool + Send + Sync>;

/// Handles one inbound message. Runs on its own task.
pub type MessageAction = Arc<dyn Fn(ProtocolMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Routes inbound messages to waiting requests or registered actions.
pub struct MessageHandler {
    directory: Arc<EndpointDirectory>,
    pending: PendingTable<ProtocolMessage>,
    actions: RwLock<Vec<(MessageFilter, MessageAction)>>,
    last_chance: RwLock<Option<MessageAction>>,
}

impl MessageHandler {
    pub fn new(directory: Arc<EndpointDirectory>) -> Self {
        Self {
            directory,
            pending: PendingTable::new(),
            actions: RwLock::new(Vec::new()),
            last_chance: RwLock::new(None),
        }
    }

    /// Register an action for every message `filter` accepts.
    pub fn register_action(&self, filter: MessageFilter, action: MessageAction) {
        self.actions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((filter, action));
    }

    /// Register an action for one message type.
    pub fn register_for(&self, message_type: MessageType, action: MessageAction) {
        self.register_action(
            Arc::new(move |msg: &ProtocolMessage| msg.message_type() == message_type),
            action,
        );
    }

    /// Action for messages no registered filter accepted.
    pub fn set_last_chance_action(&self, action: MessageAction) {
        *self.last_chance.write().unwrap_or_else(|e| e.into_inner()) = Some(action);
    }

    /// Expect a reply to `message_id` from `endpoint`.
    ///
    /// The wait is registered before this returns, so call it before
    /// sending the request. The future fails with a timeout after `timeout`
    /// and is cancelled if the endpoint signs off or the local channel
    /// closes.
    pub fn forward_response(
        &self,
        endpoint: EndpointId,
        message_id: MessageId,
        timeout: Duration,
    ) -> BoxFuture<'static, WireResult<ProtocolMessage>> {
        self.pending.register((endpoint, message_id), (), timeout)
    }

    /// Dispatch one inbound message.
    pub fn process_message(&self, message: ProtocolMessage) {
        let responding_to = message.responding_to();
        if !responding_to.is_none() {
            if let Some(waiter) = self.pending.take(&(message.sender.clone(), responding_to)) {
                trace!(
                    endpoint = %message.sender,
                    responding_to = %responding_to,
                    "Response matched pending request"
                );
                waiter.complete(Ok(message));
                return;
            }
        }

        if !message.is_handshake()
            && !self.directory.can_communicate_with_endpoint(&message.sender)
        {
            debug!(
                endpoint = %message.sender,
                message_type = ?message.message_type(),
                "Dropping message from endpoint that is not connected"
            );
            return;
        }

        let matched: Vec<MessageAction> = {
            let actions = self.actions.read().unwrap_or_else(|e| e.into_inner());
            actions
                .iter()
                .filter(|(filter, _)| filter(&message))
                .map(|(_, action)| Arc::clone(action))
                .collect()
        };

        if matched.is_empty() {
            let last_chance = self
                .last_chance
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            match last_chance {
                Some(action) => {
                    tokio::spawn(action(message));
                }
                None => debug!(
                    endpoint = %message.sender,
                    message_type = ?message.message_type(),
                    "No action for message"
                ),
            }
            return;
        }

        for action in matched {
            tokio::spawn(action(message.clone()));
        }
    }

    /// Drop one wait registered with [`forward_response`](Self::forward_response).
    pub fn cancel_response(&self, endpoint: &EndpointId, message_id: MessageId) -> bool {
        self.pending.cancel(&(endpoint.clone(), message_id))
    }

    /// Cancel every wait on an endpoint that signed off.
    pub fn on_endpoint_signed_off(&self, endpoint: &EndpointId) {
        let cancelled = self.pending.cancel_endpoint(endpoint);
        if cancelled > 0 {
            debug!(endpoint = %endpoint, cancelled, "Cancelled pending responses");
        }
    }

    /// Cancel every wait. Called when the local channel closes.
    pub fn on_local_channel_closed(&self) {
        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled all pending responses");
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use crate::message::MessageKind;
    use futures::FutureExt;
    use peermesh_types::{DiscoveryInformation, EndpointInformation, ProtocolInformation};
    use tokio::sync::mpsc;

    fn approved(directory: &EndpointDirectory, id: &EndpointId) {
        let version = crate::message::PROTOCOL_VERSION;
        directory.try_add(EndpointInformation::new(
            id.clone(),
            DiscoveryInformation::new(version, "net.tcp://h:1/discovery".parse().unwrap()),
            ProtocolInformation::new(
                version,
                "net.tcp://h:1/protocol/messages/x".parse().unwrap(),
                None,
            ),
        ));
    }

    fn recorder() -> (MessageAction, mpsc::UnboundedReceiver<ProtocolMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let action: MessageAction = Arc::new(move |msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
            .boxed()
        });
        (action, rx)
    }

    fn verification(sender: &EndpointId) -> ProtocolMessage {
        let kind = MessageKind::ConnectionVerification { custom_data: None };
        ProtocolMessage::new(sender.clone(), kind)
    }

    #[tokio::test]
    async fn test_response_completes_wait() {
        let directory = Arc::new(EndpointDirectory::new());
        let handler = MessageHandler::new(directory);
        let remote = EndpointId::new("remote", 7);
        let request = MessageId::new();

        let wait = handler.forward_response(remote.clone(), request, Duration::from_secs(5));
        let reply = ProtocolMessage::new(
            remote,
            MessageKind::Success {
                responding_to: request,
                description: None,
            },
        );
        let reply_id = reply.id;
        handler.process_message(reply);

        assert_eq!(wait.await.unwrap().id, reply_id);
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_from_other_endpoint_does_not_match() {
        let directory = Arc::new(EndpointDirectory::new());
        let handler = MessageHandler::new(directory);
        let request = MessageId::new();
        let _wait =
            handler.forward_response(EndpointId::new("remote", 7), request, Duration::from_secs(5));

        handler.process_message(ProtocolMessage::new(
            EndpointId::new("other", 8),
            MessageKind::Success {
                responding_to: request,
                description: None,
            },
        ));
        assert_eq!(handler.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_blocked_sender_only_gets_handshake_through() {
        let directory = Arc::new(EndpointDirectory::new());
        let handler = MessageHandler::new(Arc::clone(&directory));
        let (action, mut rx) = recorder();
        handler.register_action(Arc::new(|_: &ProtocolMessage| true), action);
        let stranger = EndpointId::new("stranger", 1);

        handler.process_message(verification(&stranger));
        handler.process_message(ProtocolMessage::new(
            stranger.clone(),
            MessageKind::EndpointDisconnect,
        ));

        let delivered = rx.recv().await.unwrap();
        assert!(matches!(delivered.kind, MessageKind::EndpointDisconnect));
        assert!(rx.try_recv().is_err());

        approved(&directory, &stranger);
        handler.process_message(verification(&stranger));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            MessageKind::ConnectionVerification { .. }
        ));
    }

    #[tokio::test]
    async fn test_filters_select_actions() {
        let directory = Arc::new(EndpointDirectory::new());
        let handler = MessageHandler::new(Arc::clone(&directory));
        let (verify_action, mut verify_rx) = recorder();
        let (disconnect_action, mut disconnect_rx) = recorder();
        handler.register_for(MessageType::ConnectionVerification, verify_action);
        handler.register_for(MessageType::EndpointDisconnect, disconnect_action);
        let peer = EndpointId::new("peer", 1);
        approved(&directory, &peer);

        handler.process_message(verification(&peer));
        assert!(verify_rx.recv().await.is_some());
        assert!(disconnect_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unmatched_goes_to_last_chance() {
        let directory = Arc::new(EndpointDirectory::new());
        let handler = MessageHandler::new(Arc::clone(&directory));
        let (last_chance, mut rx) = recorder();
        handler.set_last_chance_action(last_chance);
        let peer = EndpointId::new("peer", 1);
        approved(&directory, &peer);

        handler.process_message(verification(&peer));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_sign_off_cancels_only_that_endpoint() {
        let directory = Arc::new(EndpointDirectory::new());
        let handler = MessageHandler::new(directory);
        let gone = EndpointId::new("gone", 1);
        let staying = EndpointId::new("staying", 1);
        let wait_gone =
            handler.forward_response(gone.clone(), MessageId::new(), Duration::from_secs(5));
        let _wait_staying =
            handler.forward_response(staying, MessageId::new(), Duration::from_secs(5));

        handler.on_endpoint_signed_off(&gone);
        assert!(matches!(wait_gone.await, Err(WireError::Cancelled)));
        assert_eq!(handler.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_local_close_cancels_everything() {
        let directory = Arc::new(EndpointDirectory::new());
        let handler = MessageHandler::new(directory);
        let waits: Vec<_> = (0..3)
            .map(|i| {
                let peer = EndpointId::new("peer", i);
                handler.forward_response(peer, MessageId::new(), Duration::from_secs(5))
            })
            .collect();

        handler.on_local_channel_closed();
        assert_eq!(handler.pending_count(), 0);
        for wait in waits {
            assert!(matches!(wait.await, Err(WireError::Cancelled)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let directory = Arc::new(EndpointDirectory::new());
        let handler = MessageHandler::new(directory);
        let wait = handler.forward_response(
            EndpointId::new("slow", 1),
            MessageId::new(),
            Duration::from_millis(50),
        );
        assert!(matches!(wait.await, Err(WireError::Timeout(_))));
        assert_eq!(handler.pending_count(), 0);
    }
}
