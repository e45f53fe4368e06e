//! Prometheus metrics for Bifrost
//!
//! Exposes metrics at /metrics endpoint for monitoring the bridge:
//! message throughput, forwarding failures and latency, and broker
//! connection state.

use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All Bifrost metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Broker connection
    pub broker_connected: IntGauge,
    pub reconnects_total: IntCounter,
    pub subscriptions_total: IntCounter,
    pub unsubscriptions_total: IntCounter,

    // Messages
    pub messages_received_total: IntCounter,
    pub messages_bytes_received: IntCounter,

    // Forwarding
    pub forwards_succeeded_total: IntCounter,
    pub forwards_failed_total: IntCounterVec,
    pub forwards_in_flight: IntGauge,
    pub forward_latency: Histogram,
}

/// Register `collector` with `registry` and hand it back.
/// Panics on a duplicate metric name.
fn registered<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry.register(Box::new(collector.clone())).unwrap();
    collector
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    registered(registry, IntCounter::new(name, help).unwrap())
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    registered(registry, IntGauge::new(name, help).unwrap())
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let broker_connected = gauge(
            &registry,
            "bifrost_broker_connected",
            "1 while the broker connection is up, 0 otherwise",
        );
        let reconnects_total = counter(
            &registry,
            "bifrost_reconnects_total",
            "Broker reconnections after a lost connection",
        );
        let subscriptions_total = counter(
            &registry,
            "bifrost_subscriptions_total",
            "Subscriptions acknowledged by the broker",
        );
        let unsubscriptions_total = counter(
            &registry,
            "bifrost_unsubscriptions_total",
            "Unsubscriptions acknowledged by the broker",
        );

        let messages_received_total = counter(
            &registry,
            "bifrost_messages_received_total",
            "PUBLISH messages received on the bridged topic",
        );
        let messages_bytes_received = counter(
            &registry,
            "bifrost_messages_bytes_received_total",
            "Payload bytes received on the bridged topic",
        );

        let forwards_succeeded_total = counter(
            &registry,
            "bifrost_forwards_succeeded_total",
            "Messages forwarded with a successful HTTP response",
        );
        let forwards_failed_total = registered(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "bifrost_forwards_failed_total",
                    "Messages whose forwarding failed, by reason",
                ),
                &["reason"],
            )
            .unwrap(),
        );
        let forwards_in_flight = gauge(
            &registry,
            "bifrost_forwards_in_flight",
            "HTTP requests currently outstanding",
        );
        let forward_latency = registered(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "bifrost_forward_latency_seconds",
                    "Time from dispatch to complete HTTP response",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            )
            .unwrap(),
        );

        Self {
            registry,
            broker_connected,
            reconnects_total,
            subscriptions_total,
            unsubscriptions_total,
            messages_received_total,
            messages_bytes_received,
            forwards_succeeded_total,
            forwards_failed_total,
            forwards_in_flight,
            forward_latency,
        }
    }

    /// Whether the broker connection is currently up
    pub fn is_broker_connected(&self) -> bool {
        self.broker_connected.get() > 0
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
