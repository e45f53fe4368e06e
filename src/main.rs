//! Bifrost - MQTT to HTTP bridge
//!
//! Usage:
//!   bifrost [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   --broker-host <HOST>       Broker host (default: 127.0.0.1)
//!   --broker-port <PORT>       Broker port (default: 1883)
//!   -t, --topic <FILTER>       Topic filter to bridge
//!   -e, --endpoint <URL>       Endpoint messages are forwarded to
//!   --http-target <URL>        Base URL for relative endpoints
//!   -l, --log-level            Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use bifrost::config::Config;
use bifrost::{Bridge, BridgeError, Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Bifrost - MQTT to HTTP bridge
#[derive(Parser, Debug)]
#[command(name = "bifrost")]
#[command(author = "Bifrost Contributors")]
#[command(version)]
#[command(about = "Relays messages from an MQTT topic to an HTTP endpoint")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker hostname or IP address
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker TCP port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Username for broker authentication
    #[arg(short, long)]
    username: Option<String>,

    /// Password for broker authentication
    #[arg(short, long)]
    password: Option<String>,

    /// Client ID presented to the broker
    #[arg(long)]
    client_id: Option<String>,

    /// Topic filter to subscribe to
    #[arg(short, long)]
    topic: Option<String>,

    /// Endpoint messages are forwarded to (absolute, or relative to --http-target)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Base URL for relative endpoints
    #[arg(long)]
    http_target: Option<String>,

    /// HTTP method for forwarded requests
    #[arg(short, long)]
    method: Option<String>,

    /// Maximum concurrent forwards
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI args override file and environment config
    fn apply(&self, config: &mut Config) {
        if let Some(ref host) = self.broker_host {
            config.broker.host = host.clone();
        }
        if let Some(port) = self.broker_port {
            config.broker.port = port;
        }
        if let Some(ref username) = self.username {
            config.broker.username = Some(username.clone());
        }
        if let Some(ref password) = self.password {
            config.broker.password = Some(password.clone());
        }
        if let Some(ref client_id) = self.client_id {
            config.broker.client_id = client_id.clone();
        }
        if let Some(ref topic) = self.topic {
            config.bridge.topic = Some(topic.clone());
        }
        if let Some(ref endpoint) = self.endpoint {
            config.bridge.endpoint = Some(endpoint.clone());
        }
        if let Some(ref target) = self.http_target {
            config.http.target = target.clone();
        }
        if let Some(ref method) = self.method {
            config.http.method = method.clone();
        }
        if let Some(max_in_flight) = self.max_in_flight {
            config.http.max_in_flight = max_in_flight;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // File (if any) plus BIFROST__* environment overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let (Some(topic), Some(endpoint)) = (config.bridge.topic.clone(), config.bridge.endpoint.clone())
    else {
        eprintln!("A topic and an endpoint are required (--topic/--endpoint or [bridge] in the config file)");
        std::process::exit(1);
    };

    let options = config.to_options();

    info!("Starting Bifrost MQTT to HTTP bridge");
    info!("  Broker: {}", options.broker_url());
    info!("  Client ID: {}", options.client_id);
    info!("  Topic: {}", topic);
    info!("  Endpoint: {} {}", options.http_method, endpoint);
    info!("  Max in flight: {}", options.max_in_flight);

    let mut bridge = Bridge::new(&options);

    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new());
        bridge = bridge.with_metrics(metrics.clone());
        info!("  Metrics: enabled (http://{})", config.metrics.bind);

        let metrics_server = MetricsServer::new(metrics, config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    // The broker may not be up yet; retry with backoff until connected or interrupted
    let mut retry_interval = options.reconnect_interval;
    loop {
        let result = tokio::select! {
            result = bridge.connect(&topic, &endpoint) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted before the bridge was connected");
                return Ok(());
            }
        };

        match result {
            Ok(()) => break,
            Err(e) if e.is_retryable() => {
                warn!("Connect failed: {}, retrying in {:?}", e, retry_interval);
                tokio::select! {
                    _ = tokio::time::sleep(retry_interval) => {}
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
                retry_interval = std::cmp::min(retry_interval * 2, options.max_reconnect_interval);
            }
            Err(e) => {
                error!("Cannot start bridge: {}", e);
                std::process::exit(1);
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    match tokio::time::timeout(
        options.disconnect_grace + Duration::from_secs(5),
        bridge.disconnect(&topic),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(BridgeError::NotConnected)) => {}
        Ok(Err(e)) => warn!("Disconnect failed: {}", e),
        Err(_) => warn!("Disconnect did not complete in time"),
    }

    Ok(())
}
