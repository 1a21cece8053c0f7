//! Endpoint identity and addressing.

use crate::channel::ChannelTemplate;
use crate::error::PeerMeshError;
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use url::Url;

/// Globally unique identifier of one communicating process instance.
///
/// Formatted as `machine:process`, and always parseable back into the
/// machine name it originated from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId(String);

impl EndpointId {
    /// Build an id from a machine name and a process id.
    pub fn new(machine: &str, process: u32) -> Self {
        Self(format!("{machine}:{process}"))
    }

    /// Build the id of the running process on this machine.
    pub fn for_current_process() -> Self {
        let machine = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self::new(&machine, std::process::id())
    }

    /// The machine name this endpoint runs on.
    pub fn machine_name(&self) -> &str {
        // Validated at construction, so the separator is always present.
        self.0.rsplit_once(':').map(|(m, _)| m).unwrap_or(&self.0)
    }

    /// The process part of the id.
    pub fn process_id(&self) -> Option<u32> {
        self.0.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for EndpointId {
    type Err = PeerMeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((machine, process)) if !machine.is_empty() && process.parse::<u32>().is_ok() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(PeerMeshError::InvalidEndpointId(s.to_string())),
        }
    }
}

impl TryFrom<String> for EndpointId {
    type Error = PeerMeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> Self {
        id.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to reach an endpoint's discovery channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryInformation {
    /// Protocol version spoken by the discovery channel.
    pub version: ProtocolVersion,
    /// Address of the discovery channel.
    pub address: Url,
}

impl DiscoveryInformation {
    pub fn new(version: ProtocolVersion, address: Url) -> Self {
        Self { version, address }
    }
}

/// One versioned protocol endpoint: where messages and data go.
///
/// Identity is `(version, message_address)`; the data address is
/// informational and does not take part in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolInformation {
    pub version: ProtocolVersion,
    pub message_address: Url,
    pub data_address: Option<Url>,
}

impl ProtocolInformation {
    pub fn new(version: ProtocolVersion, message_address: Url, data_address: Option<Url>) -> Self {
        Self {
            version,
            message_address,
            data_address,
        }
    }

    /// The transport family of the message address.
    pub fn channel_template(&self) -> ChannelTemplate {
        ChannelTemplate::from_address(&self.message_address)
    }
}

impl PartialEq for ProtocolInformation {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.message_address == other.message_address
    }
}

impl Eq for ProtocolInformation {}

impl Hash for ProtocolInformation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version.hash(state);
        self.message_address.hash(state);
    }
}

/// Full description of a known remote endpoint.
///
/// Built once a handshake completes. Never mutated: a reconnect produces a
/// new instance that replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInformation {
    pub id: EndpointId,
    pub discovery: DiscoveryInformation,
    pub protocol: ProtocolInformation,
}

impl EndpointInformation {
    pub fn new(
        id: EndpointId,
        discovery: DiscoveryInformation,
        protocol: ProtocolInformation,
    ) -> Self {
        Self {
            id,
            discovery,
            protocol,
        }
    }
}
