//! Configuration Module
//!
//! Provides TOML-based configuration for Bifrost with support for:
//! - Broker connection settings (host, port, credentials, keep-alive)
//! - HTTP forwarding settings (target, method, timeouts, concurrency)
//! - The bridged topic and endpoint
//! - Reconnect backoff
//! - Metrics endpoint
//! - Environment variable overrides (BIFROST__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use options::{BridgeOptions, DEFAULT_CLIENT_ID, DEFAULT_CONTENT_TYPE};

mod options;


/// Pattern for `${VAR}` and `${VAR:-fallback}` references
fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern compiles")
    })
}

/// Replace `${VAR}` / `${VAR:-fallback}` with the environment value.
/// Unset variables without a fallback become empty strings.
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let fallback = caps.get(2).map_or("", |m| m.as_str());
            std::env::var(&caps[1]).unwrap_or_else(|_| fallback.to_owned())
        })
        .into_owned()
}

/// Errors raised while loading or checking configuration
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read
    Io(std::io::Error),
    /// The file is not valid TOML for [`Config`]
    Parse(toml::de::Error),
    /// Layering file, defaults and environment failed
    Config(config::ConfigError),
    /// Values parsed but are unusable
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "malformed config: {}", e),
            ConfigError::Config(e) => write!(f, "cannot build config: {}", e),
            ConfigError::Validation(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Everything the `bifrost` binary reads from file and environment
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    /// Broker connection
    pub broker: BrokerConfig,
    /// HTTP forwarding
    pub http: HttpConfig,
    /// Bridged topic and endpoint
    pub bridge: BridgeConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Prometheus endpoint
    pub metrics: MetricsConfig,
}

/// `[log]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace; the CLI flag wins
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker hostname or IP address
    pub host: String,
    /// Broker TCP port
    pub port: u16,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Client ID presented to the broker
    pub client_id: String,
    /// Keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Connect and acknowledgement timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Maximum MQTT packet size in bytes
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let defaults = BridgeOptions::default();
        Self {
            host: defaults.broker_host,
            port: defaults.broker_port,
            username: None,
            password: None,
            client_id: defaults.client_id,
            keep_alive: defaults.keep_alive,
            connect_timeout: defaults.connect_timeout,
            max_packet_size: defaults.max_packet_size,
        }
    }
}

/// HTTP forwarding configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Base URL for relative endpoints
    pub target: String,
    /// HTTP method (POST, PUT, ...)
    pub method: String,
    /// Content-Type of forwarded requests
    pub content_type: String,
    /// Timeout for one forwarded request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum concurrent forwards
    pub max_in_flight: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let defaults = BridgeOptions::default();
        Self {
            target: defaults.http_target,
            method: defaults.http_method,
            content_type: defaults.content_type,
            request_timeout: defaults.request_timeout,
            max_in_flight: defaults.max_in_flight,
        }
    }
}

/// Bridged topic and endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Topic filter to subscribe to
    pub topic: Option<String>,
    /// Endpoint that messages are forwarded to (absolute or relative to `http.target`)
    pub endpoint: Option<String>,
    /// Grace period for disconnect
    #[serde(with = "humantime_serde")]
    pub disconnect_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic: None,
            endpoint: None,
            disconnect_grace: BridgeOptions::default().disconnect_grace,
        }
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial delay
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Maximum delay (exponential backoff cap)
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let defaults = BridgeOptions::default();
        Self {
            interval: defaults.reconnect_interval,
            max_interval: defaults.max_reconnect_interval,
        }
    }
}

impl Config {
    /// Read `path` and layer `BIFROST__*` environment variables on top.
    ///
    /// The file may reference the environment itself with `${VAR}` or
    /// `${VAR:-fallback}`. Environment keys use `__` between levels:
    /// `BIFROST__BROKER__HOST=mqtt.local` sets `broker.host`,
    /// `BIFROST__BRIDGE__TOPIC=sensors/#` sets `bridge.topic`.
    /// A missing file is not an error; defaults apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let defaults = BridgeOptions::default();
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.host", defaults.broker_host)?
            .set_default("broker.port", i64::from(defaults.broker_port))?
            .set_default("broker.client_id", defaults.client_id)?
            .set_default("broker.keep_alive", "30s")?
            .set_default("broker.connect_timeout", "30s")?
            .set_default("broker.max_packet_size", defaults.max_packet_size as i64)?
            .set_default("http.method", defaults.http_method)?
            .set_default("http.content_type", defaults.content_type)?
            .set_default("http.request_timeout", "30s")?
            .set_default("http.max_in_flight", defaults.max_in_flight as i64)?
            .set_default("bridge.disconnect_grace", "2s")?
            .set_default("reconnect.interval", "5s")?
            .set_default("reconnect.max_interval", "60s")?
            .set_default("metrics.enabled", false)?;

        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => {
                let content = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&content, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix("BIFROST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse TOML text without environment handling
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config = toml::from_str::<Config>(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the bridge options, topic filter and endpoint
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_options()
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if let Some(ref topic) = self.bridge.topic {
            crate::topic::validate_topic_filter(topic).map_err(|e| {
                ConfigError::Validation(format!("bridge.topic '{}': {}", topic, e))
            })?;
        }

        if let Some(ref endpoint) = self.bridge.endpoint {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "bridge.endpoint cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Build bridge options from this configuration
    pub fn to_options(&self) -> BridgeOptions {
        let mut options = BridgeOptions::new()
            .with_broker_host(self.broker.host.clone())
            .with_broker_port(self.broker.port)
            .with_client_id(self.broker.client_id.clone())
            .with_keep_alive(self.broker.keep_alive)
            .with_connect_timeout(self.broker.connect_timeout)
            .with_max_packet_size(self.broker.max_packet_size)
            .with_http_target(self.http.target.clone())
            .with_http_method(self.http.method.clone())
            .with_content_type(self.http.content_type.clone())
            .with_request_timeout(self.http.request_timeout)
            .with_max_in_flight(self.http.max_in_flight)
            .with_disconnect_grace(self.bridge.disconnect_grace)
            .with_reconnect_backoff(self.reconnect.interval, self.reconnect.max_interval);

        if let Some(ref username) = self.broker.username {
            options = options.with_broker_credentials(
                username.clone(),
                self.broker.password.clone().unwrap_or_default(),
            );
        }

        options
    }
}

/// Prometheus endpoint; `/ready` reports the broker connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics`, `/health` and `/ready`
    pub enabled: bool,
    /// Listen address of the metrics server
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}
