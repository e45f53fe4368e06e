//! Bounded dispatch of forwards
//!
//! Every message is forwarded on its own task, but at most `max_in_flight`
//! run at once. When all permits are taken `dispatch` waits, which pushes
//! back on the broker connection instead of dropping messages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Forward, InboundMessage};
use crate::metrics::Metrics;

/// Runs forwards with bounded concurrency
pub struct Dispatcher {
    forwarder: Arc<dyn Forward>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    metrics: Option<Arc<Metrics>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(
        forwarder: Arc<dyn Forward>,
        max_in_flight: usize,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let max_in_flight = max_in_flight
            .clamp(1, u32::MAX as usize)
            .min(Semaphore::MAX_PERMITS);

        Self {
            forwarder,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            metrics,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Forward a message on a new task, waiting for a free slot first
    pub async fn dispatch(&self, message: InboundMessage) {
        if let Some(ref metrics) = self.metrics {
            metrics.messages_received_total.inc();
            metrics
                .messages_bytes_received
                .inc_by(message.payload.len() as u64);
        }

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Dispatcher closed, dropping message on '{}'",
                    message.topic
                );
                return;
            }
        };

        let forwarder = self.forwarder.clone();
        let metrics = self.metrics.clone();

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let _permit = permit;
            forward_one(forwarder.as_ref(), &message, metrics.as_deref()).await;
        });
    }

    /// Abort every forward still running. Aborted requests are not retried.
    pub fn abort_all(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Aborting {} forwards", tasks.len());
        }
        tasks.abort_all();
    }

    /// Number of forwards currently running
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.permits.available_permits())
    }

    /// Wait up to `grace` for running forwards to finish.
    /// Returns false if some were still running when the grace period ended.
    pub async fn drain(&self, grace: Duration) -> bool {
        match timeout(grace, self.permits.acquire_many(self.max_in_flight as u32)).await {
            Ok(Ok(_all)) => true,
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }
}

/// Holds the `forwards_in_flight` gauge up, including when the forward is aborted
struct InFlight<'a>(Option<&'a Metrics>);

impl<'a> InFlight<'a> {
    fn enter(metrics: Option<&'a Metrics>) -> Self {
        if let Some(metrics) = metrics {
            metrics.forwards_in_flight.inc();
        }
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(metrics) = self.0 {
            metrics.forwards_in_flight.dec();
        }
    }
}

async fn forward_one(forwarder: &dyn Forward, message: &InboundMessage, metrics: Option<&Metrics>) {
    let started = Instant::now();
    let in_flight = InFlight::enter(metrics);

    debug!(
        "Forwarding {} bytes from '{}' to {}",
        message.payload.len(),
        message.topic,
        forwarder.target()
    );

    let result = forwarder.forward(message).await;

    drop(in_flight);
    if let Some(metrics) = metrics {
        metrics
            .forward_latency
            .observe(started.elapsed().as_secs_f64());
    }

    match result {
        Ok(outcome) => {
            if let Some(metrics) = metrics {
                metrics.forwards_succeeded_total.inc();
            }
            info!(
                "Posted data to {} ({}): {}",
                forwarder.target(),
                outcome.status,
                String::from_utf8_lossy(&outcome.body)
            );
        }
        Err(e) => {
            if let Some(metrics) = metrics {
                metrics
                    .forwards_failed_total
                    .with_label_values(&[e.reason()])
                    .inc();
            }
            warn!(
                "Forwarding message from '{}' to {} failed: {}",
                message.topic,
                forwarder.target(),
                e
            );
        }
    }
}
