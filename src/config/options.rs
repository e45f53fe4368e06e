//! Bridge Options
//!
//! The connection parameters a [`Bridge`](crate::Bridge) is built from.
//! Options are assembled with chained `with_*` setters and are not checked
//! until the bridge connects.

use std::time::Duration;

use hyper::Method;

use crate::bridge::BridgeError;

/// Default client identifier presented to the broker
pub const DEFAULT_CLIENT_ID: &str = "bifrost_client";

/// Default content type of forwarded requests
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Connection parameters for a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Broker hostname or IP address
    pub broker_host: String,
    /// Broker TCP port
    pub broker_port: u16,
    /// Username for broker authentication
    pub broker_username: Option<String>,
    /// Password for broker authentication
    pub broker_password: Option<String>,
    /// Client identifier sent in CONNECT
    pub client_id: String,
    /// MQTT keep-alive interval (zero disables keep-alive)
    pub keep_alive: Duration,
    /// Timeout for the connect handshake and for SUBACK/UNSUBACK
    pub connect_timeout: Duration,
    /// Largest MQTT packet accepted from or sent to the broker
    pub max_packet_size: usize,
    /// Base URL that relative endpoints are resolved against
    pub http_target: String,
    /// HTTP method used for forwarded requests
    pub http_method: String,
    /// Content-Type header sent with every forwarded request
    pub content_type: String,
    /// Timeout for a single forwarded request, body included
    pub request_timeout: Duration,
    /// Maximum number of forwards running at once
    pub max_in_flight: usize,
    /// How long `disconnect` waits for outstanding work before closing
    pub disconnect_grace: Duration,
    /// First delay before reconnecting to a lost broker
    pub reconnect_interval: Duration,
    /// Upper bound for the reconnect delay
    pub max_reconnect_interval: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            broker_username: None,
            broker_password: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            max_packet_size: 1024 * 1024,
            http_target: String::new(),
            http_method: "POST".to_string(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            request_timeout: Duration::from_secs(30),
            max_in_flight: 64,
            disconnect_grace: Duration::from_millis(2000),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_interval: Duration::from_secs(60),
        }
    }
}

impl BridgeOptions {
    /// Create options populated with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker_host(mut self, host: impl Into<String>) -> Self {
        self.broker_host = host.into();
        self
    }

    pub fn with_broker_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    /// Set username and password; an empty username means anonymous
    pub fn with_broker_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.broker_username = Some(username.into());
        self.broker_password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn with_http_target(mut self, target: impl Into<String>) -> Self {
        self.http_target = target.into();
        self
    }

    pub fn with_http_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = method.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    /// Set the initial and maximum reconnect delay
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_interval = initial;
        self.max_reconnect_interval = max;
        self
    }

    /// Broker URL in `tcp://host:port` form
    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.broker_host, self.broker_port)
    }

    /// Credentials to send in CONNECT, if any
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self.broker_username.as_deref() {
            Some(username) if !username.is_empty() => Some((
                username,
                self.broker_password.as_deref().unwrap_or_default(),
            )),
            _ => None,
        }
    }

    /// Parsed HTTP method
    pub fn method(&self) -> Result<Method, BridgeError> {
        Method::from_bytes(self.http_method.as_bytes()).map_err(|_| {
            BridgeError::InvalidConfig(format!("invalid HTTP method '{}'", self.http_method))
        })
    }

    /// Check the options before any connection attempt
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.broker_host.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "broker host cannot be empty".to_string(),
            ));
        }

        if self.broker_port == 0 {
            return Err(BridgeError::InvalidConfig(
                "broker port must be between 1 and 65535".to_string(),
            ));
        }

        if self.client_id.is_empty() || self.client_id.starts_with(' ') {
            return Err(BridgeError::InvalidConfig(
                "client id cannot be empty or start with a space".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "connect and request timeouts must be non-zero".to_string(),
            ));
        }

        if self.max_packet_size == 0 {
            return Err(BridgeError::InvalidConfig(
                "max packet size must be non-zero".to_string(),
            ));
        }

        // rumqttc rejects keep-alive intervals below one second
        if !self.keep_alive.is_zero() && self.keep_alive < Duration::from_secs(1) {
            return Err(BridgeError::InvalidConfig(
                "keep-alive must be zero or at least one second".to_string(),
            ));
        }

        self.method()?;

        if self.content_type.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "content type cannot be empty".to_string(),
            ));
        }

        if self.max_in_flight == 0 {
            return Err(BridgeError::InvalidConfig(
                "max_in_flight must be at least 1".to_string(),
            ));
        }

        if self.max_reconnect_interval < self.reconnect_interval {
            return Err(BridgeError::InvalidConfig(
                "max reconnect interval cannot be shorter than the initial interval".to_string(),
            ));
        }

        Ok(())
    }
}
