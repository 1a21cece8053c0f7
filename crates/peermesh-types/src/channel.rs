//! Transport families.

use crate::error::PeerMeshError;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// The category of transport used for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelTemplate {
    /// No transport. Invalid for any opened channel.
    None,
    /// Local inter-process transport.
    NamedPipe,
    /// Plain TCP.
    TcpIP,
    /// HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// A scheme nobody recognised.
    Unknown,
}

impl ChannelTemplate {
    /// URI scheme used by addresses of this template.
    pub fn scheme(&self) -> Option<&'static str> {
        match self {
            Self::NamedPipe => Some("net.pipe"),
            Self::TcpIP => Some("net.tcp"),
            Self::Http => Some("http"),
            Self::Https => Some("https"),
            Self::None | Self::Unknown => None,
        }
    }

    /// Map a URI scheme back onto a template.
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "net.pipe" | "pipe" => Self::NamedPipe,
            "net.tcp" | "tcp" => Self::TcpIP,
            "http" => Self::Http,
            "https" => Self::Https,
            _ => Self::Unknown,
        }
    }

    /// Determine the template an address belongs to.
    pub fn from_address(address: &Url) -> Self {
        Self::from_scheme(address.scheme())
    }

    /// Reject templates that can never be opened.
    pub fn ensure_usable(self) -> Result<Self, PeerMeshError> {
        match self {
            Self::None | Self::Unknown => {
                Err(PeerMeshError::InvalidChannelTemplate(self.to_string()))
            }
            other => Ok(other),
        }
    }
}

impl fmt::Display for ChannelTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::NamedPipe => write!(f, "named_pipe"),
            Self::TcpIP => write!(f, "tcp_ip"),
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
