//! Bifrost - MQTT to HTTP bridge
//!
//! Subscribes to a topic filter on an MQTT broker and forwards every
//! message it receives to an HTTP endpoint, one request per message.

pub mod bridge;
pub mod config;
pub mod forwarder;
pub mod metrics;
pub mod topic;

pub use bridge::{Bridge, BridgeError, ConnectionStatus};
pub use config::{BridgeOptions, Config};
pub use forwarder::{Forward, ForwardError, ForwardOutcome, HttpForwarder, InboundMessage};
pub use metrics::{Metrics, MetricsServer};
