//! Bridge Module Tests
//!
//! These run without a broker; the full publish-to-HTTP path is covered by
//! the integration tests.

use std::time::Duration;

use pretty_assertions::assert_eq;
use test_case::test_case;

use super::*;

/// Options pointing at a port nothing listens on
fn unreachable_options() -> BridgeOptions {
    BridgeOptions::new()
        .with_broker_host("127.0.0.1")
        .with_broker_port(1)
        .with_http_target("http://127.0.0.1:9000")
        .with_connect_timeout(Duration::from_secs(2))
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_new_bridge_is_disconnected() {
    let bridge = Bridge::new(&BridgeOptions::new());

    assert!(!bridge.is_connected());
    assert_eq!(bridge.status(), ConnectionStatus::Disconnected);
    assert_eq!(bridge.topic(), None);
}

#[test]
fn test_options_are_a_snapshot() {
    let mut options = BridgeOptions::new().with_broker_host("first.local");
    let bridge = Bridge::new(&options);

    options.broker_host = "second.local".to_string();
    options.broker_port = 8883;

    assert_eq!(bridge.options().broker_host, "first.local");
    assert_eq!(bridge.options().broker_port, 1883);
}

#[tokio::test]
async fn test_disconnect_when_disconnected() {
    let mut bridge = Bridge::new(&BridgeOptions::new());

    let result = bridge.disconnect("sensors/#").await;
    assert!(matches!(result, Err(BridgeError::NotConnected)));
    assert_eq!(bridge.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_connect_refused() {
    let mut bridge = Bridge::new(&unreachable_options());

    let err = bridge.connect("sensors/#", "/ingest").await.unwrap_err();
    assert!(matches!(err, BridgeError::Connection(_)), "got {:?}", err);
    assert!(err.is_retryable());
    assert!(!bridge.is_connected());
    assert_eq!(bridge.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_connect_failure_leaves_bridge_reusable() {
    let mut bridge = Bridge::new(&unreachable_options());

    assert!(bridge.connect("a/b", "/ingest").await.is_err());
    // A failed connect must not count as connected
    assert!(matches!(
        bridge.connect("a/b", "/ingest").await,
        Err(BridgeError::Connection(_))
    ));
    assert!(matches!(
        bridge.disconnect("a/b").await,
        Err(BridgeError::NotConnected)
    ));
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test_case("" ; "empty topic")]
#[test_case("sensors/#/temp" ; "hash not last")]
#[test_case("sensors/te+mp" ; "plus inside level")]
#[tokio::test]
async fn test_connect_rejects_topic(topic: &str) {
    let mut bridge = Bridge::new(&unreachable_options());

    let err = bridge.connect(topic, "/ingest").await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidConfig(_)), "got {:?}", err);
    assert!(!err.is_retryable());
}

#[test_case("https://example.com/ingest" ; "tls endpoint")]
#[test_case("ftp://example.com/ingest" ; "unsupported scheme")]
#[test_case("http:///ingest" ; "missing host")]
#[tokio::test]
async fn test_connect_rejects_endpoint(endpoint: &str) {
    let mut bridge = Bridge::new(&unreachable_options());

    let err = bridge.connect("sensors/#", endpoint).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidConfig(_)), "got {:?}", err);
    assert_eq!(bridge.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_connect_rejects_invalid_options() {
    let options = unreachable_options().with_http_method("BAD METHOD");
    let mut bridge = Bridge::new(&options);

    let err = bridge.connect("sensors/#", "/ingest").await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidConfig(_)), "got {:?}", err);
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_error_retryable() {
    assert!(BridgeError::Connection("refused".into()).is_retryable());
    assert!(BridgeError::Subscription("rejected".into()).is_retryable());
    assert!(BridgeError::Timeout("SUBACK").is_retryable());

    assert!(!BridgeError::InvalidConfig("bad".into()).is_retryable());
    assert!(!BridgeError::AlreadyConnected.is_retryable());
    assert!(!BridgeError::NotConnected.is_retryable());
}

#[test]
fn test_error_display() {
    assert_eq!(
        BridgeError::Timeout("SUBACK").to_string(),
        "Timed out waiting for SUBACK"
    );
    assert_eq!(
        BridgeError::InvalidConfig("broker host cannot be empty".into()).to_string(),
        "Invalid config: broker host cannot be empty"
    );
    assert_eq!(
        BridgeError::NotConnected.to_string(),
        "Bridge is not connected"
    );
}

#[test]
fn test_status_display() {
    assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
    assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
    assert_eq!(ConnectionStatus::Backoff.to_string(), "backoff");
}

#[test]
fn test_status_mirrored_into_metrics() {
    let metrics = Arc::new(Metrics::new());
    let cell = StatusCell::new(Some(metrics.clone()));

    cell.set(ConnectionStatus::Connected);
    assert!(metrics.is_broker_connected());

    cell.set(ConnectionStatus::Backoff);
    assert!(!metrics.is_broker_connected());
    assert_eq!(cell.get(), ConnectionStatus::Backoff);
}
