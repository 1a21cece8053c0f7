//! The sending surface components use to talk to remote endpoints.
//!
//! The handshake conductor and the connection monitor do not own channels.
//! They reach remote endpoints through a [`ProtocolMessenger`], which the
//! protocol layer implements.

use crate::error::{WireError, WireResult};
use crate::message::{MessageKind, ProtocolMessage};
use async_trait::async_trait;
use peermesh_types::{ChannelTemplate, EndpointId, EndpointInformation};
use std::time::Duration;

#[async_trait]
pub trait ProtocolMessenger: Send + Sync {
    /// Identity of the local endpoint.
    fn local_endpoint(&self) -> EndpointId;

    /// Whether the local node may use `template`.
    fn supports_template(&self, template: ChannelTemplate) -> bool;

    /// The local endpoint as seen through `template`, opening that channel
    /// if it is not open yet.
    async fn local_information_for(
        &self,
        template: ChannelTemplate,
    ) -> WireResult<EndpointInformation>;

    /// Send a message to a known endpoint.
    async fn send_message_to(
        &self,
        endpoint: &EndpointId,
        message: ProtocolMessage,
        retry_count: u32,
    ) -> WireResult<()>;

    /// Send a message and wait for the endpoint's reply to it.
    async fn send_message_and_wait_for_response(
        &self,
        endpoint: &EndpointId,
        message: ProtocolMessage,
        retry_count: u32,
        timeout: Duration,
    ) -> WireResult<ProtocolMessage>;

    /// Ping an endpoint and return the custom data it answered with.
    async fn verify_connection(
        &self,
        endpoint: &EndpointId,
        timeout: Duration,
        custom_data: Option<serde_json::Value>,
    ) -> WireResult<Option<serde_json::Value>> {
        let request = ProtocolMessage::new(
            self.local_endpoint(),
            MessageKind::ConnectionVerification { custom_data },
        );
        let reply = self
            .send_message_and_wait_for_response(endpoint, request, 0, timeout)
            .await?;
        match reply.kind {
            MessageKind::ConnectionVerificationResponse { custom_data, .. } => Ok(custom_data),
            other => Err(WireError::UnexpectedResponse(format!(
                "{:?} to connection verification",
                other.message_type()
            ))),
        }
    }
}
