//! Error types shared by the ports and adapters.
//!
//! None of these reach callers of the engine: every failure is logged and
//! degraded to "no known position" or a dropped write.

use std::fmt;

#[derive(Debug)]
pub enum PositionError {
    /// Storage medium disabled, over quota, or unreadable.
    StorageUnavailable(String),
    Io(std::io::Error),
    Serialization(serde_json::Error),
    /// Remote store answered with a non-2xx status or a malformed payload.
    RemoteUnreachable(String),
    Http(reqwest::Error),
    /// Player handle destroyed or not ready yet.
    PlayerUnavailable(String),
    InvariantViolation(String),
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionError::StorageUnavailable(e) => write!(f, "Storage unavailable: {}", e),
            PositionError::Io(e) => write!(f, "IO error: {}", e),
            PositionError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PositionError::RemoteUnreachable(e) => write!(f, "Remote unreachable: {}", e),
            PositionError::Http(e) => write!(f, "HTTP error: {}", e),
            PositionError::PlayerUnavailable(e) => write!(f, "Player unavailable: {}", e),
            PositionError::InvariantViolation(e) => write!(f, "Invariant violation: {}", e),
        }
    }
}

impl std::error::Error for PositionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PositionError::Io(e) => Some(e),
            PositionError::Serialization(e) => Some(e),
            PositionError::Http(e) => Some(e),
            PositionError::StorageUnavailable(_)
            | PositionError::RemoteUnreachable(_)
            | PositionError::PlayerUnavailable(_)
            | PositionError::InvariantViolation(_) => None,
        }
    }
}

impl From<std::io::Error> for PositionError {
    fn from(err: std::io::Error) -> Self {
        PositionError::Io(err)
    }
}

impl From<serde_json::Error> for PositionError {
    fn from(err: serde_json::Error) -> Self {
        PositionError::Serialization(err)
    }
}

impl From<reqwest::Error> for PositionError {
    fn from(err: reqwest::Error) -> Self {
        PositionError::Http(err)
    }
}

impl PositionError {
    /// True for failures that happened while talking to the remote store.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            PositionError::RemoteUnreachable(_) | PositionError::Http(_)
        )
    }
}
