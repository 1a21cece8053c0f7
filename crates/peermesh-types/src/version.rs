//! Protocol version numbers.

use crate::error::PeerMeshError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version of the protocol spoken over a discovery or message channel.
///
/// Ordered by `(major, minor)` so negotiation can pick the highest version
/// both sides understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = PeerMeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| PeerMeshError::InvalidProtocolVersion(s.to_string()))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| PeerMeshError::InvalidProtocolVersion(s.to_string()))
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let v: ProtocolVersion = "1.2".parse().unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 2));
        assert_eq!(v.to_string(), "1.2");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("1".parse::<ProtocolVersion>().is_err());
        assert!("a.b".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(ProtocolVersion::new(1, 10) > ProtocolVersion::new(1, 2));
        assert!(ProtocolVersion::new(2, 0) > ProtocolVersion::new(1, 99));
    }
}
