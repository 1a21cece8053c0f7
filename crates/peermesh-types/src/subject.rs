//! Communication subjects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named capability area an application participates in.
///
/// Two endpoints may only connect when they share at least one subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunicationSubject(String);

impl CommunicationSubject {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommunicationSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommunicationSubject {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Returns `true` if the two subject sets have at least one subject in common.
pub fn have_common_subject(
    local: &[CommunicationSubject],
    remote: &[CommunicationSubject],
) -> bool {
    local.iter().any(|s| remote.contains(s))
}
