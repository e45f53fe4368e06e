//! Bridge errors

use std::fmt;

/// Error type for bridge lifecycle operations
#[derive(Debug)]
pub enum BridgeError {
    /// Options, topic or endpoint are unusable; retrying will not help
    InvalidConfig(String),
    /// Broker unreachable, connection refused or lost during a handshake
    Connection(String),
    /// Broker rejected or failed a SUBSCRIBE/UNSUBSCRIBE
    Subscription(String),
    /// An acknowledgement did not arrive in time
    Timeout(&'static str),
    /// `connect` called on a connected bridge
    AlreadyConnected,
    /// `disconnect` called on a disconnected bridge
    NotConnected,
}

impl BridgeError {
    /// Whether the same call may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection(_) | BridgeError::Subscription(_) | BridgeError::Timeout(_)
        )
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            BridgeError::Connection(msg) => write!(f, "Connection error: {}", msg),
            BridgeError::Subscription(msg) => write!(f, "Subscription error: {}", msg),
            BridgeError::Timeout(what) => write!(f, "Timed out waiting for {}", what),
            BridgeError::AlreadyConnected => write!(f, "Bridge is already connected"),
            BridgeError::NotConnected => write!(f, "Bridge is not connected"),
        }
    }
}

impl std::error::Error for BridgeError {}
