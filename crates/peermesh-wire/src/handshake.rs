//! Handshake conductor: negotiates connections with remote endpoints.
//!
//! Each remote endpoint moves through `unknown -> contacted -> approved`,
//! or falls back to unknown when rejected. The conductor drives both sides
//! of the exchange:
//!
//! - **Local-initiated**: a discovery source reports an endpoint. The
//!   conductor marks it contacted, sends `EndpointConnect` and waits for
//!   `Success` or `Failure`/timeout (forget it). `Success` carries the
//!   remote's own description, which must pass the same local checks before
//!   the endpoint is registered. If it does not, the conductor withdraws
//!   with `EndpointDisconnect`.
//! - **Remote-initiated**: an `EndpointConnect` arrives. The conductor
//!   checks compatibility, replies `Success` or `Failure`, and on success
//!   registers the endpoint right after replying.
//!
//! A connected endpoint that shows up again at new addresses on the same
//! channel type replaces its old directory entry.
//!
//! Rejection is never an error. It is logged and the endpoint stays unknown.

use crate::directory::EndpointDirectory;
use crate::error::{WireError, WireResult};
use crate::handler::{MessageAction, MessageHandler};
use crate::message::{
    ConnectDescription, MessageKind, MessageType, ProtocolMessage, PROTOCOL_VERSION,
};
use crate::messenger::ProtocolMessenger;
use futures::FutureExt;
use peermesh_types::subject::have_common_subject;
use peermesh_types::{
    CommunicationSubject, DiscoveryInformation, EndpointId, EndpointInformation,
    ProtocolInformation, ProtocolVersion,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retries for handshake replies.
const REPLY_RETRIES: u32 = 1;

/// Veto over which endpoints may connect, registered per protocol version.
pub trait ApproveEndpointConnections: Send + Sync {
    /// The protocol version this approver judges.
    fn protocol_version(&self) -> ProtocolVersion;

    /// Whether an endpoint presenting `description` may connect.
    fn is_endpoint_allowed_to_connect(&self, description: &ConnectDescription) -> bool;
}

/// What the local endpoint advertises about itself during a handshake.
#[derive(Debug, Clone, Default)]
pub struct LocalDescription {
    pub subjects: Vec<CommunicationSubject>,
    pub command_proxies: Vec<String>,
    pub notification_proxies: Vec<String>,
}

impl LocalDescription {
    pub fn new(subjects: Vec<CommunicationSubject>) -> Self {
        Self {
            subjects,
            ..Self::default()
        }
    }
}

/// Drives the connect handshake for every remote endpoint.
pub struct HandshakeConductor {
    messenger: Weak<dyn ProtocolMessenger>,
    directory: Arc<EndpointDirectory>,
    local: LocalDescription,
    approvers: RwLock<HashMap<ProtocolVersion, Vec<Arc<dyn ApproveEndpointConnections>>>>,
    wait_for_connection: Duration,
}

impl HandshakeConductor {
    pub fn new(
        messenger: Weak<dyn ProtocolMessenger>,
        directory: Arc<EndpointDirectory>,
        local: LocalDescription,
        wait_for_connection: Duration,
    ) -> Self {
        Self {
            messenger,
            directory,
            local,
            approvers: RwLock::new(HashMap::new()),
            wait_for_connection,
        }
    }

    pub fn subjects(&self) -> &[CommunicationSubject] {
        &self.local.subjects
    }

    /// Add an approver for the version it reports.
    pub fn register_approver(&self, approver: Arc<dyn ApproveEndpointConnections>) {
        self.approvers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(approver.protocol_version())
            .or_default()
            .push(approver);
    }

    /// Hook the conductor's handshake actions into `handler`.
    pub fn register_actions(self: &Arc<Self>, handler: &MessageHandler) {
        let conductor = Arc::clone(self);
        let on_connect: MessageAction = Arc::new(move |msg| {
            let conductor = Arc::clone(&conductor);
            async move {
                if let Err(e) = conductor.handle_endpoint_connect(msg).await {
                    warn!(error = %e, "Handling connect request failed");
                }
            }
            .boxed()
        });
        handler.register_for(MessageType::EndpointConnect, on_connect);

        let conductor = Arc::clone(self);
        let on_disconnect: MessageAction = Arc::new(move |msg| {
            let conductor = Arc::clone(&conductor);
            async move {
                info!(endpoint = %msg.sender, "Endpoint signed off");
                conductor.on_endpoint_becoming_unavailable(&msg.sender);
            }
            .boxed()
        });
        handler.register_for(MessageType::EndpointDisconnect, on_disconnect);
    }

    fn messenger(&self) -> WireResult<Arc<dyn ProtocolMessenger>> {
        self.messenger.upgrade().ok_or(WireError::ShuttingDown)
    }

    /// Start a handshake with a newly discovered endpoint.
    ///
    /// Returns whether the endpoint is connected afterwards. Rejections and
    /// timeouts are not errors; failures to send the connect request are.
    pub async fn on_endpoint_becoming_available(
        &self,
        remote: EndpointInformation,
    ) -> WireResult<bool> {
        let messenger = self.messenger()?;
        if remote.id == messenger.local_endpoint() {
            return Ok(false);
        }
        if let Some(known) = self.directory.try_get_connection_for(&remote.id) {
            if !moved(&known, &remote) {
                debug!(endpoint = %remote.id, "Endpoint already connected, skipping handshake");
                return Ok(true);
            }
            info!(
                endpoint = %remote.id,
                old = %known.protocol.message_address,
                new = %remote.protocol.message_address,
                "Endpoint moved, connecting again"
            );
            self.directory.try_remove_endpoint(&remote.id);
        } else if self.directory.is_waiting_for_approval(&remote.id) {
            debug!(endpoint = %remote.id, "Handshake already in progress");
            return Ok(false);
        }
        let template = remote.protocol.channel_template();
        if !messenger.supports_template(template) {
            debug!(endpoint = %remote.id, template = %template, "No shared channel type");
            return Ok(false);
        }
        if !self.directory.try_start_approval(remote.clone()) {
            return Ok(self.directory.can_communicate_with_endpoint(&remote.id));
        }

        let local = match messenger.local_information_for(template).await {
            Ok(local) => local,
            Err(e) => {
                self.cancel_unless_approved(&remote.id);
                return Err(e);
            }
        };
        let request = ProtocolMessage::new(
            local.id.clone(),
            MessageKind::EndpointConnect(self.describe(&local)),
        );
        debug!(endpoint = %remote.id, "Sending connect request");

        let reply = messenger
            .send_message_and_wait_for_response(
                &remote.id,
                request,
                REPLY_RETRIES,
                self.wait_for_connection,
            )
            .await;
        match reply {
            Ok(reply) => match reply.kind {
                MessageKind::Success {
                    description: Some(description),
                    ..
                } => {
                    if self.accepts(messenger.as_ref(), &description) {
                        self.complete(endpoint_information(&remote.id, &description));
                        Ok(true)
                    } else {
                        info!(endpoint = %remote.id, "Refusing endpoint that accepted us");
                        self.withdraw(messenger.as_ref(), &remote.id).await;
                        Ok(false)
                    }
                }
                MessageKind::Success {
                    description: None, ..
                } => {
                    warn!(endpoint = %remote.id, "Connect reply did not describe the endpoint");
                    self.withdraw(messenger.as_ref(), &remote.id).await;
                    Ok(false)
                }
                MessageKind::Failure { .. } => {
                    info!(endpoint = %remote.id, "Endpoint rejected the connection");
                    self.cancel_unless_approved(&remote.id);
                    Ok(false)
                }
                other => {
                    warn!(
                        endpoint = %remote.id,
                        reply = ?other.message_type(),
                        "Unexpected reply to connect request"
                    );
                    self.cancel_unless_approved(&remote.id);
                    Ok(false)
                }
            },
            Err(WireError::Timeout(after)) => {
                info!(
                    endpoint = %remote.id,
                    after = ?after,
                    "Endpoint did not answer connect request"
                );
                self.cancel_unless_approved(&remote.id);
                Ok(false)
            }
            Err(WireError::Cancelled) => {
                debug!(endpoint = %remote.id, "Connect request cancelled");
                self.cancel_unless_approved(&remote.id);
                Ok(false)
            }
            Err(e) => {
                self.cancel_unless_approved(&remote.id);
                Err(e)
            }
        }
    }

    /// Forget an endpoint that went away.
    pub fn on_endpoint_becoming_unavailable(&self, id: &EndpointId) {
        if self.directory.try_remove_endpoint(id) {
            debug!(endpoint = %id, "Endpoint removed");
        }
    }

    /// Answer an inbound `EndpointConnect`.
    pub async fn handle_endpoint_connect(&self, message: ProtocolMessage) -> WireResult<()> {
        let MessageKind::EndpointConnect(description) = &message.kind else {
            return Ok(());
        };
        let messenger = self.messenger()?;
        let remote = endpoint_information(&message.sender, description);
        let mut accepted = self.accepts(messenger.as_ref(), description);

        // The reply goes to whatever address the directory holds, so the
        // remote must be known, at its current address, before replying.
        let newly_contacted = match self.directory.try_get_connection_for(&remote.id) {
            Some(known) if accepted && moved(&known, &remote) => {
                self.directory.try_add(remote.clone());
                false
            }
            Some(_) => false,
            None => self.directory.try_start_approval(remote.clone()),
        };

        let kind = if accepted {
            match messenger
                .local_information_for(description.channel_template)
                .await
            {
                Ok(local) => MessageKind::Success {
                    responding_to: message.id,
                    description: Some(self.describe(&local)),
                },
                Err(e) => {
                    warn!(error = %e, "Cannot describe local endpoint, refusing connection");
                    accepted = false;
                    MessageKind::Failure {
                        responding_to: message.id,
                    }
                }
            }
        } else {
            MessageKind::Failure {
                responding_to: message.id,
            }
        };
        let reply = ProtocolMessage::new(messenger.local_endpoint(), kind);
        let sent = messenger
            .send_message_to(&message.sender, reply, REPLY_RETRIES)
            .await;

        if accepted && sent.is_ok() {
            self.complete(remote);
        } else if newly_contacted {
            self.cancel_unless_approved(&message.sender);
        }
        if !accepted {
            info!(endpoint = %message.sender, "Rejected connection request");
        }
        sent
    }

    /// Compatibility check for a remote description.
    fn accepts(&self, messenger: &dyn ProtocolMessenger, description: &ConnectDescription) -> bool {
        if description.protocol_version.major != PROTOCOL_VERSION.major {
            debug!(version = %description.protocol_version, "Unsupported protocol version");
            return false;
        }
        if !messenger.supports_template(description.channel_template) {
            debug!(template = %description.channel_template, "Unsupported channel type");
            return false;
        }
        if !have_common_subject(&self.local.subjects, &description.subjects) {
            debug!("No common subject");
            return false;
        }
        let approvers = self.approvers.read().unwrap_or_else(|e| e.into_inner());
        approvers
            .get(&description.protocol_version)
            .map(|list| {
                list.iter()
                    .all(|a| a.is_endpoint_allowed_to_connect(description))
            })
            .unwrap_or(true)
    }

    /// Back out of a handshake the remote side already accepted.
    async fn withdraw(&self, messenger: &dyn ProtocolMessenger, id: &EndpointId) {
        let goodbye =
            ProtocolMessage::new(messenger.local_endpoint(), MessageKind::EndpointDisconnect);
        if let Err(e) = messenger.send_message_to(id, goodbye, 0).await {
            debug!(endpoint = %id, error = %e, "Withdrawal not delivered");
        }
        self.cancel_unless_approved(id);
    }

    fn describe(&self, local: &EndpointInformation) -> ConnectDescription {
        ConnectDescription {
            protocol_version: local.protocol.version,
            channel_template: local.protocol.channel_template(),
            discovery_address: local.discovery.address.clone(),
            message_address: local.protocol.message_address.clone(),
            data_address: local.protocol.data_address.clone(),
            subjects: self.local.subjects.clone(),
            command_proxies: self.local.command_proxies.clone(),
            notification_proxies: self.local.notification_proxies.clone(),
        }
    }

    /// Register an approved endpoint unless the other direction of a
    /// simultaneous handshake already did. A moved endpoint replaces its
    /// old entry. An endpoint that signed off meanwhile is not revived.
    fn complete(&self, remote: EndpointInformation) {
        if let Some(known) = self.directory.try_get_connection_for(&remote.id) {
            if !moved(&known, &remote) {
                return;
            }
        }
        self.directory.try_approve(remote);
    }

    fn cancel_unless_approved(&self, id: &EndpointId) {
        self.directory.try_cancel_approval(id);
    }
}

/// Whether `update` is a connected endpoint now reachable at different
/// addresses over the same channel type.
fn moved(known: &EndpointInformation, update: &EndpointInformation) -> bool {
    known.protocol.channel_template() == update.protocol.channel_template()
        && (known.protocol.message_address != update.protocol.message_address
            || known.protocol.data_address != update.protocol.data_address)
}

/// Build endpoint information from a connect description.
pub fn endpoint_information(
    id: &EndpointId,
    description: &ConnectDescription,
) -> EndpointInformation {
    EndpointInformation::new(
        id.clone(),
        DiscoveryInformation::new(
            description.protocol_version,
            description.discovery_address.clone(),
        ),
        ProtocolInformation::new(
            description.protocol_version,
            description.message_address.clone(),
            description.data_address.clone(),
        ),
    )
}
