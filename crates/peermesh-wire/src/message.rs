//! Wire protocol message types.
//!
//! Every frame on a channel starts with a one-byte tag and a 4-byte
//! big-endian length, followed by a JSON body. Message frames end there;
//! data frames append an 8-byte big-endian payload length and the raw
//! payload bytes.

use crate::error::{WireError, WireResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use peermesh_types::{ChannelTemplate, CommunicationSubject, EndpointId, MessageId, ProtocolVersion};
use serde::{Deserialize, Serialize};
use url::Url;

/// Current protocol version.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0);

/// Frame tag for a [`ProtocolMessage`].
pub const TAG_MESSAGE: u8 = 1;
/// Frame tag for a [`DataTransferMessage`].
pub const TAG_DATA: u8 = 2;

/// A protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Unique message ID.
    pub id: MessageId,
    /// The endpoint that sent the message.
    pub sender: EndpointId,
    /// Message variant.
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl ProtocolMessage {
    /// Create a message with a fresh id.
    pub fn new(sender: EndpointId, kind: MessageKind) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            kind,
        }
    }

    /// The id of the message this one answers, or [`MessageId::NONE`].
    pub fn responding_to(&self) -> MessageId {
        match &self.kind {
            MessageKind::Success { responding_to, .. }
            | MessageKind::Failure { responding_to }
            | MessageKind::UnknownMessageType { responding_to }
            | MessageKind::ConnectionVerificationResponse { responding_to, .. }
            | MessageKind::Application { responding_to, .. } => *responding_to,
            _ => MessageId::NONE,
        }
    }

    /// Handshake messages are delivered even when the sender is not approved.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::EndpointConnect(_)
                | MessageKind::Success { .. }
                | MessageKind::Failure { .. }
                | MessageKind::EndpointDisconnect
        )
    }

    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }
}

/// The different kinds of protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Handshake request carrying the sender's connection description.
    EndpointConnect(ConnectDescription),
    /// Positive reply. Answers to `EndpointConnect` carry the responder's
    /// own description so the initiator can judge it too.
    Success {
        responding_to: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<ConnectDescription>,
    },
    /// Negative reply.
    Failure { responding_to: MessageId },
    /// The sender is going away.
    EndpointDisconnect,
    /// The receiver had no handler for the message it answers.
    UnknownMessageType { responding_to: MessageId },
    /// Keep-alive ping.
    ConnectionVerification {
        #[serde(default)]
        custom_data: Option<serde_json::Value>,
    },
    /// Keep-alive answer.
    ConnectionVerificationResponse {
        responding_to: MessageId,
        #[serde(default)]
        custom_data: Option<serde_json::Value>,
    },
    /// Ask the receiver to upload a stream, correlated by this message's id.
    DataDownloadRequest {
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Opaque application message for higher layers.
    Application {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default = "none_id")]
        responding_to: MessageId,
    },
}

fn none_id() -> MessageId {
    MessageId::NONE
}

impl MessageKind {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::EndpointConnect(_) => MessageType::EndpointConnect,
            Self::Success { .. } => MessageType::Success,
            Self::Failure { .. } => MessageType::Failure,
            Self::EndpointDisconnect => MessageType::EndpointDisconnect,
            Self::UnknownMessageType { .. } => MessageType::UnknownMessageType,
            Self::ConnectionVerification { .. } => MessageType::ConnectionVerification,
            Self::ConnectionVerificationResponse { .. } => {
                MessageType::ConnectionVerificationResponse
            }
            Self::DataDownloadRequest { .. } => MessageType::DataDownloadRequest,
            Self::Application { .. } => MessageType::Application,
        }
    }
}

/// Discriminant of [`MessageKind`], used to filter message actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    EndpointConnect,
    Success,
    Failure,
    EndpointDisconnect,
    UnknownMessageType,
    ConnectionVerification,
    ConnectionVerificationResponse,
    DataDownloadRequest,
    Application,
}

/// What an endpoint tells a peer about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectDescription {
    pub protocol_version: ProtocolVersion,
    pub channel_template: ChannelTemplate,
    pub discovery_address: Url,
    pub message_address: Url,
    pub data_address: Option<Url>,
    pub subjects: Vec<CommunicationSubject>,
    #[serde(default)]
    pub command_proxies: Vec<String>,
    #[serde(default)]
    pub notification_proxies: Vec<String>,
}

/// A block of data pushed over a data channel.
#[derive(Debug, Clone)]
pub struct DataTransferMessage {
    pub id: MessageId,
    pub sender: EndpointId,
    pub receiver: EndpointId,
    /// The download request this transfer answers.
    pub responding_to: MessageId,
    pub data: Bytes,
}

#[derive(Serialize, Deserialize)]
struct DataTransferHeader {
    id: MessageId,
    sender: EndpointId,
    receiver: EndpointId,
    responding_to: MessageId,
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Message(ProtocolMessage),
    Data(DataTransferMessage),
}

/// Encode a message frame (tag + 4-byte length + JSON).
pub fn encode_message(msg: &ProtocolMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let mut bytes = Vec::with_capacity(5 + json.len());
    bytes.push(TAG_MESSAGE);
    bytes.extend_from_slice(&(json.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Encode a data frame (tag + 4-byte header length + JSON header +
/// 8-byte payload length + payload).
pub fn encode_data(msg: &DataTransferMessage) -> Result<Vec<u8>, serde_json::Error> {
    let header = serde_json::to_vec(&DataTransferHeader {
        id: msg.id,
        sender: msg.sender.clone(),
        receiver: msg.receiver.clone(),
        responding_to: msg.responding_to,
    })?;
    let mut bytes = BytesMut::with_capacity(13 + header.len() + msg.data.len());
    bytes.put_u8(TAG_DATA);
    bytes.put_u32(header.len() as u32);
    bytes.put_slice(&header);
    bytes.put_u64(msg.data.len() as u64);
    bytes.put_slice(&msg.data);
    Ok(bytes.to_vec())
}

/// Decode the tag and length from a 5-byte frame header.
pub fn decode_header(header: &[u8; 5]) -> (u8, u32) {
    let mut buf = &header[..];
    let tag = buf.get_u8();
    (tag, buf.get_u32())
}

/// Parse a JSON body into a ProtocolMessage.
pub fn decode_message(body: &[u8]) -> Result<ProtocolMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Rebuild a data transfer from its JSON header and payload.
pub fn decode_data(header: &[u8], data: Bytes) -> WireResult<DataTransferMessage> {
    let header: DataTransferHeader = serde_json::from_slice(header).map_err(WireError::Json)?;
    Ok(DataTransferMessage {
        id: header.id,
        sender: header.sender,
        receiver: header.receiver,
        responding_to: header.responding_to,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> EndpointId {
        EndpointId::new("alpha", 1)
    }

    fn connect_description() -> ConnectDescription {
        ConnectDescription {
            protocol_version: PROTOCOL_VERSION,
            channel_template: ChannelTemplate::TcpIP,
            discovery_address: "net.tcp://alpha:4000/discovery".parse().unwrap(),
            message_address: "net.tcp://alpha:4000/protocol/messages/x".parse().unwrap(),
            data_address: Some("net.tcp://alpha:4001/protocol/data/y".parse().unwrap()),
            subjects: vec![CommunicationSubject::from("a")],
            command_proxies: vec!["calculator".to_string()],
            notification_proxies: vec![],
        }
    }

    #[test]
    fn test_encode_decode_message() {
        let msg = ProtocolMessage::new(sender(), MessageKind::EndpointDisconnect);
        let bytes = encode_message(&msg).unwrap();
        let (tag, len) = decode_header(&[bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(tag, TAG_MESSAGE);
        assert_eq!(len as usize, bytes.len() - 5);
        let decoded = decode_message(&bytes[5..]).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.sender, sender());
        assert_eq!(decoded.message_type(), MessageType::EndpointDisconnect);
    }

    #[test]
    fn test_endpoint_connect_serialization() {
        let msg =
            ProtocolMessage::new(sender(), MessageKind::EndpointConnect(connect_description()));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("endpoint_connect"));
        assert!(json.contains("calculator"));
        let decoded: ProtocolMessage = serde_json::from_str(&json).unwrap();
        match decoded.kind {
            MessageKind::EndpointConnect(desc) => assert_eq!(desc, connect_description()),
            other => panic!("Expected EndpointConnect, got {other:?}"),
        }
    }

    #[test]
    fn test_responding_to() {
        let request = ProtocolMessage::new(
            sender(),
            MessageKind::ConnectionVerification { custom_data: None },
        );
        assert!(request.responding_to().is_none());

        let reply = ProtocolMessage::new(
            sender(),
            MessageKind::ConnectionVerificationResponse {
                responding_to: request.id,
                custom_data: Some(serde_json::json!({"load": 3})),
            },
        );
        assert_eq!(reply.responding_to(), request.id);
    }

    #[test]
    fn test_success_description_is_optional() {
        let request = MessageId::new();
        let bare = concat!(
            r#"{"id":"6f1c7f3e-3f1e-4d0b-9c59-7a8c1b0e2d11","sender":"alpha:1","#,
            r#""type":"success","responding_to":"7a8c1b0e-3f1e-4d0b-9c59-6f1c7f3e2d11"}"#
        );
        let msg: ProtocolMessage = serde_json::from_str(bare).unwrap();
        assert!(matches!(msg.kind, MessageKind::Success { description: None, .. }));

        let reply = ProtocolMessage::new(
            sender(),
            MessageKind::Success {
                responding_to: request,
                description: Some(connect_description()),
            },
        );
        let decoded: ProtocolMessage =
            serde_json::from_str(&serde_json::to_string(&reply).unwrap()).unwrap();
        assert_eq!(decoded.responding_to(), request);
        match decoded.kind {
            MessageKind::Success { description, .. } => {
                assert_eq!(description, Some(connect_description()))
            }
            other => panic!("Expected Success, got {other:?}"),
        }
    }

    #[test]
    fn test_application_defaults_to_no_response() {
        let json = concat!(
            r#"{"id":"6f1c7f3e-3f1e-4d0b-9c59-7a8c1b0e2d11","sender":"alpha:1","#,
            r#""type":"application","name":"ping"}"#
        );
        let msg: ProtocolMessage = serde_json::from_str(json).unwrap();
        assert!(msg.responding_to().is_none());
        assert_eq!(msg.message_type(), MessageType::Application);
    }

    #[test]
    fn test_handshake_classification() {
        let connect =
            ProtocolMessage::new(sender(), MessageKind::EndpointConnect(connect_description()));
        assert!(connect.is_handshake());
        let app = ProtocolMessage::new(
            sender(),
            MessageKind::Application {
                name: "x".to_string(),
                payload: serde_json::Value::Null,
                responding_to: MessageId::NONE,
            },
        );
        assert!(!app.is_handshake());
    }

    #[test]
    fn test_data_frame_layout() {
        let transfer = DataTransferMessage {
            id: MessageId::new(),
            sender: sender(),
            receiver: EndpointId::new("beta", 2),
            responding_to: MessageId::new(),
            data: Bytes::from_static(b"hello world"),
        };
        let bytes = encode_data(&transfer).unwrap();
        let (tag, header_len) = decode_header(&[bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(tag, TAG_DATA);
        let header_end = 5 + header_len as usize;
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[header_end..header_end + 8]);
        assert_eq!(u64::from_be_bytes(len_bytes), 11);

        let decoded = decode_data(
            &bytes[5..header_end],
            Bytes::copy_from_slice(&bytes[header_end + 8..]),
        )
        .unwrap();
        assert_eq!(decoded.responding_to, transfer.responding_to);
        assert_eq!(&decoded.data[..], b"hello world");
    }
}
