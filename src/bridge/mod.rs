//! MQTT to HTTP Bridge
//!
//! A [`Bridge`] subscribes to one topic filter on an MQTT broker and
//! forwards every message it receives to an HTTP endpoint.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --connect(topic, endpoint)--> Connected+Subscribed
//! Connected+Subscribed --disconnect(topic)--> Disconnected
//! ```
//!
//! `connect` on a connected bridge fails with [`BridgeError::AlreadyConnected`];
//! `disconnect` on a disconnected one fails with [`BridgeError::NotConnected`].
//!
//! # Example
//!
//! ```no_run
//! use bifrost::{Bridge, BridgeOptions};
//!
//! # async fn run() -> Result<(), bifrost::BridgeError> {
//! let options = BridgeOptions::new()
//!     .with_broker_host("localhost")
//!     .with_http_target("http://localhost:9000");
//!
//! let mut bridge = Bridge::new(&options);
//! bridge.connect("sensors/#", "/ingest").await?;
//! // ... messages on sensors/# are POSTed to http://localhost:9000/ingest
//! bridge.disconnect("sensors/#").await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::BridgeOptions;
use crate::forwarder::{Dispatcher, Forward, HttpForwarder};
use crate::metrics::Metrics;
use crate::topic::validate_topic_filter;

use connection::{BrokerConnection, StatusCell};

pub use connection::ConnectionStatus;
pub use error::BridgeError;

/// The active subscription of a connected bridge
struct Session {
    connection: BrokerConnection,
    topic: String,
    target: String,
}

/// Relays messages from a broker topic to an HTTP endpoint
pub struct Bridge {
    /// Snapshot of the options the bridge was created with
    options: BridgeOptions,
    status: StatusCell,
    metrics: Option<Arc<Metrics>>,
    session: Option<Session>,
}

impl Bridge {
    /// Create a bridge from a snapshot of `options`.
    ///
    /// Nothing is validated or opened until [`connect`](Self::connect).
    pub fn new(options: &BridgeOptions) -> Self {
        Self {
            options: options.clone(),
            status: StatusCell::new(None),
            metrics: None,
            session: None,
        }
    }

    /// Record bridge activity in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.status = StatusCell::new(Some(metrics.clone()));
        self.metrics = Some(metrics);
        self
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Current state of the broker connection
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    /// Whether `connect` has succeeded and `disconnect` has not been called
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Topic filter of the active subscription
    pub fn topic(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.topic.as_str())
    }

    /// Connect to the broker and forward every message on `topic` to `endpoint`.
    ///
    /// `endpoint` is either an absolute `http://` URL or a path resolved
    /// against the configured HTTP target. Returns once the broker has
    /// acknowledged the subscription.
    pub async fn connect(&mut self, topic: &str, endpoint: &str) -> Result<(), BridgeError> {
        if self.session.is_some() {
            return Err(BridgeError::AlreadyConnected);
        }

        self.options.validate()?;
        let forwarder = HttpForwarder::new(endpoint, &self.options)?;
        self.connect_with(topic, Arc::new(forwarder)).await
    }

    /// Connect to the broker and hand every message on `topic` to `forwarder`
    pub async fn connect_with(
        &mut self,
        topic: &str,
        forwarder: Arc<dyn Forward>,
    ) -> Result<(), BridgeError> {
        if self.session.is_some() {
            return Err(BridgeError::AlreadyConnected);
        }

        self.options.validate()?;
        validate_topic_filter(topic)
            .map_err(|e| BridgeError::InvalidConfig(format!("topic '{}': {}", topic, e)))?;

        let target = forwarder.target();
        let dispatcher = Arc::new(Dispatcher::new(
            forwarder,
            self.options.max_in_flight,
            self.metrics.clone(),
        ));

        let mut connection = BrokerConnection::open(
            &self.options,
            dispatcher,
            self.status.clone(),
            self.metrics.clone(),
        )
        .await?;

        if let Err(e) = connection.subscribe(topic).await {
            error!("Subscribing to '{}' failed: {}", topic, e);
            connection.close(self.options.disconnect_grace).await;
            return Err(e);
        }

        info!("Bridging '{}' -> {}", topic, target);
        self.session = Some(Session {
            connection,
            topic: topic.to_string(),
            target,
        });
        Ok(())
    }

    /// Unsubscribe and close the broker connection.
    ///
    /// The active subscription is removed even when `topic` names a
    /// different filter; the mismatch is logged.
    /// The connection is closed even when unsubscribing fails; that error is
    /// returned afterwards and the bridge can connect again either way.
    pub async fn disconnect(&mut self, topic: &str) -> Result<(), BridgeError> {
        let Some(mut session) = self.session.take() else {
            return Err(BridgeError::NotConnected);
        };

        if session.topic != topic {
            warn!(
                "Disconnect requested for '{}' but the active subscription is '{}', removing that",
                topic, session.topic
            );
        }

        let result = session.connection.unsubscribe(&session.topic).await;
        if let Err(ref e) = result {
            error!("Unsubscribing from '{}' failed: {}", session.topic, e);
        }

        session
            .connection
            .close(self.options.disconnect_grace)
            .await;
        info!(
            "Stopped bridging '{}' -> {}",
            session.topic, session.target
        );

        result
    }
}
