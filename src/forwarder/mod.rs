//! Message Forwarding
//!
//! Turns messages received from the broker into outbound requests. The
//! [`Forward`] trait is the handler a bridge installs on its subscription;
//! [`HttpForwarder`] is the HTTP implementation and [`Dispatcher`] bounds
//! how many forwards run at once.
//!
//! A failed forward is logged and counted, never fatal: the subscription
//! keeps delivering subsequent messages.

mod dispatch;
mod http;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::StatusCode;

pub use dispatch::Dispatcher;
pub use http::{resolve_endpoint, HttpForwarder};

/// A message received on the bridged subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Opaque payload, forwarded verbatim
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Result of a successful forward
#[derive(Debug, Clone)]
pub struct ForwardOutcome {
    /// Response status
    pub status: StatusCode,
    /// Complete response body
    pub body: Bytes,
}

/// Error forwarding a single message
#[derive(Debug)]
pub enum ForwardError {
    /// Request could not be sent
    Request(String),
    /// Response body could not be read
    Body(String),
    /// Endpoint answered with a non-success status
    Status { status: StatusCode, body: Bytes },
    /// Request did not complete within the request timeout
    Timeout,
}

impl ForwardError {
    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ForwardError::Request(_) => "request",
            ForwardError::Body(_) => "body",
            ForwardError::Status { .. } => "status",
            ForwardError::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::Request(msg) => write!(f, "Request failed: {}", msg),
            ForwardError::Body(msg) => write!(f, "Reading response failed: {}", msg),
            ForwardError::Status { status, body } => write!(
                f,
                "Endpoint returned {}: {}",
                status,
                String::from_utf8_lossy(body)
            ),
            ForwardError::Timeout => write!(f, "Request timed out"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Handler invoked once per inbound message
///
/// Implementations are shared across concurrently delivered messages and
/// must not rely on being called in delivery order.
#[async_trait]
pub trait Forward: Send + Sync {
    /// Description of where messages go, for logging
    fn target(&self) -> String;

    /// Forward one message
    async fn forward(&self, message: &InboundMessage) -> Result<ForwardOutcome, ForwardError>;
}
