//! Broker Connection
//!
//! Owns the single MQTT connection of a bridge: the connect handshake, the
//! one active subscription, and the event-loop task that delivers inbound
//! messages and reconnects with exponential backoff when the broker goes away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::BridgeError;
use crate::config::BridgeOptions;
use crate::forwarder::{Dispatcher, InboundMessage};
use crate::metrics::Metrics;
use crate::topic::topic_matches_filter;

/// Capacity of the request channel between client handle and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Status of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected
    Disconnected,
    /// Connect handshake in progress
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection lost, backing off before retry
    Backoff,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Backoff => write!(f, "backoff"),
        }
    }
}

/// Shared status cell, mirrored into the `broker_connected` gauge
#[derive(Clone)]
pub(crate) struct StatusCell {
    status: Arc<RwLock<ConnectionStatus>>,
    metrics: Option<Arc<Metrics>>,
}

impl StatusCell {
    pub(crate) fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            metrics,
        }
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub(crate) fn set(&self, status: ConnectionStatus) {
        *self.status.write() = status;
        if let Some(ref metrics) = self.metrics {
            metrics
                .broker_connected
                .set(i64::from(status == ConnectionStatus::Connected));
        }
    }
}

/// Acknowledgements handed from the event loop to the waiting caller
#[derive(Debug)]
enum Ack {
    Subscribed(Vec<SubscribeReasonCode>),
    Unsubscribed,
}

/// An open connection to the broker
pub(crate) struct BrokerConnection {
    client: AsyncClient,
    acks: mpsc::UnboundedReceiver<Ack>,
    active_filter: Arc<RwLock<Option<String>>>,
    dispatcher: Arc<Dispatcher>,
    status: StatusCell,
    metrics: Option<Arc<Metrics>>,
    ack_timeout: Duration,
    task: JoinHandle<()>,
}

impl BrokerConnection {
    /// Connect to the broker and start the event loop.
    ///
    /// Returns once CONNACK has been received. Inbound messages are handed to
    /// `dispatcher` once a subscription is active.
    pub(crate) async fn open(
        options: &BridgeOptions,
        dispatcher: Arc<Dispatcher>,
        status: StatusCell,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, BridgeError> {
        let broker = options.broker_url();

        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.broker_host.clone(),
            options.broker_port,
        );
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(options.max_packet_size, options.max_packet_size);
        if let Some((username, password)) = options.credentials() {
            mqtt_options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        status.set(ConnectionStatus::Connecting);
        debug!("Connecting to {} as '{}'", broker, options.client_id);

        let session_present =
            match timeout(options.connect_timeout, wait_for_connack(&mut eventloop)).await {
                Ok(Ok(session_present)) => session_present,
                Ok(Err(e)) => {
                    status.set(ConnectionStatus::Disconnected);
                    return Err(BridgeError::Connection(format!("{}: {}", broker, e)));
                }
                Err(_) => {
                    status.set(ConnectionStatus::Disconnected);
                    return Err(BridgeError::Connection(format!(
                        "{}: no CONNACK within {:?}",
                        broker, options.connect_timeout
                    )));
                }
            };

        status.set(ConnectionStatus::Connected);
        info!(
            "Connected to {} (session_present={})",
            broker, session_present
        );

        let (ack_tx, acks) = mpsc::unbounded_channel();
        let active_filter = Arc::new(RwLock::new(None));

        let event_loop = EventLoopTask {
            eventloop,
            client: client.clone(),
            acks: ack_tx,
            active_filter: active_filter.clone(),
            dispatcher: dispatcher.clone(),
            status: status.clone(),
            metrics: metrics.clone(),
            broker,
            reconnect_interval: options.reconnect_interval,
            max_reconnect_interval: options.max_reconnect_interval,
        };
        let task = tokio::spawn(event_loop.run());

        Ok(Self {
            client,
            acks,
            active_filter,
            dispatcher,
            status,
            metrics,
            ack_timeout: options.connect_timeout,
            task,
        })
    }

    /// Subscribe to `filter` at QoS 0 and wait for SUBACK
    pub(crate) async fn subscribe(&mut self, filter: &str) -> Result<(), BridgeError> {
        // Set before SUBSCRIBE goes out so messages right behind SUBACK are kept
        *self.active_filter.write() = Some(filter.to_string());

        let result = self.request_subscribe(filter).await;
        if result.is_err() {
            *self.active_filter.write() = None;
        }
        result
    }

    async fn request_subscribe(&mut self, filter: &str) -> Result<(), BridgeError> {
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::Subscription(format!("'{}': {}", filter, e)))?;

        let codes = timeout(self.ack_timeout, self.next_suback())
            .await
            .map_err(|_| BridgeError::Timeout("SUBACK"))??;

        if codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(BridgeError::Subscription(format!(
                "broker rejected subscription to '{}'",
                filter
            )));
        }

        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_total.inc();
        }
        debug!("Subscribed to '{}'", filter);
        Ok(())
    }

    /// Unsubscribe from `filter` and wait for UNSUBACK.
    /// Message delivery stops as soon as this is called.
    pub(crate) async fn unsubscribe(&mut self, filter: &str) -> Result<(), BridgeError> {
        *self.active_filter.write() = None;

        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| BridgeError::Subscription(format!("'{}': {}", filter, e)))?;

        timeout(self.ack_timeout, self.next_unsuback())
            .await
            .map_err(|_| BridgeError::Timeout("UNSUBACK"))??;

        if let Some(ref metrics) = self.metrics {
            metrics.unsubscriptions_total.inc();
        }
        debug!("Unsubscribed from '{}'", filter);
        Ok(())
    }

    /// Send DISCONNECT and wait up to `grace` for the event loop and
    /// running forwards to finish, then abort whatever is left.
    pub(crate) async fn close(mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        *self.active_filter.write() = None;

        if let Err(e) = self.client.try_disconnect() {
            debug!("Could not queue DISCONNECT: {}", e);
        }

        if timeout(grace, &mut self.task).await.is_err() {
            warn!(
                "Broker connection did not close within {:?}, closing forcibly",
                grace
            );
            self.task.abort();
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.dispatcher.drain(remaining).await {
            warn!(
                "{} forwards still running after the grace period, aborting them",
                self.dispatcher.in_flight()
            );
            self.dispatcher.abort_all();
        }

        self.status.set(ConnectionStatus::Disconnected);
    }

    async fn next_suback(&mut self) -> Result<Vec<SubscribeReasonCode>, BridgeError> {
        loop {
            match self.acks.recv().await {
                Some(Ack::Subscribed(codes)) => return Ok(codes),
                Some(other) => debug!("Skipping stale {:?}", other),
                None => return Err(event_loop_stopped()),
            }
        }
    }

    async fn next_unsuback(&mut self) -> Result<(), BridgeError> {
        loop {
            match self.acks.recv().await {
                Some(Ack::Unsubscribed) => return Ok(()),
                Some(other) => debug!("Skipping stale {:?}", other),
                None => return Err(event_loop_stopped()),
            }
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn event_loop_stopped() -> BridgeError {
    BridgeError::Connection("broker event loop stopped".to_string())
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<bool, ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(connack)) = eventloop.poll().await? {
            return Ok(connack.session_present);
        }
    }
}

/// Drives the MQTT event loop after the initial handshake
struct EventLoopTask {
    eventloop: EventLoop,
    client: AsyncClient,
    acks: mpsc::UnboundedSender<Ack>,
    active_filter: Arc<RwLock<Option<String>>>,
    dispatcher: Arc<Dispatcher>,
    status: StatusCell,
    metrics: Option<Arc<Metrics>>,
    broker: String,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

impl EventLoopTask {
    async fn run(mut self) {
        let mut retry_interval = self.reconnect_interval;
        // SUBACKs for re-subscriptions after a reconnect are not waited on
        let mut resubscribes_pending = 0usize;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let matches = self
                        .active_filter
                        .read()
                        .as_deref()
                        .is_some_and(|filter| topic_matches_filter(&publish.topic, filter));

                    if matches {
                        self.dispatcher
                            .dispatch(InboundMessage {
                                topic: publish.topic,
                                payload: publish.payload,
                            })
                            .await;
                    } else {
                        debug!(
                            "Ignoring message on '{}': no active subscription matches",
                            publish.topic
                        );
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    // The first CONNACK is consumed by `open`, so this is a reconnect
                    info!(
                        "Reconnected to {} (session_present={})",
                        self.broker, connack.session_present
                    );
                    retry_interval = self.reconnect_interval;
                    self.status.set(ConnectionStatus::Connected);
                    if let Some(ref metrics) = self.metrics {
                        metrics.reconnects_total.inc();
                    }

                    let filter = self.active_filter.read().clone();
                    if let Some(filter) = filter {
                        match self.client.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                            Ok(()) => resubscribes_pending += 1,
                            Err(e) => error!("Failed to re-subscribe to '{}': {}", filter, e),
                        }
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    if resubscribes_pending > 0 {
                        resubscribes_pending -= 1;
                        if suback
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure))
                        {
                            error!("Broker rejected re-subscription after reconnect");
                        } else {
                            info!("Re-subscribed after reconnect");
                        }
                    } else {
                        let _ = self.acks.send(Ack::Subscribed(suback.return_codes));
                    }
                }
                Ok(Event::Incoming(Packet::UnsubAck(_))) => {
                    let _ = self.acks.send(Ack::Unsubscribed);
                }
                Ok(Event::Incoming(Packet::PingResp)) => {
                    debug!("PINGRESP received from {}", self.broker);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from {}", self.broker);
                    break;
                }
                Ok(_) => {}
                Err(ConnectionError::RequestsDone) => {
                    debug!("All client handles dropped, stopping event loop");
                    break;
                }
                Err(e) => {
                    error!("Connection to {} failed: {}", self.broker, e);
                    self.status.set(ConnectionStatus::Backoff);
                    resubscribes_pending = 0;

                    debug!("Reconnecting to {} in {:?}", self.broker, retry_interval);
                    tokio::time::sleep(retry_interval).await;
                    retry_interval = std::cmp::min(retry_interval * 2, self.max_reconnect_interval);
                    self.status.set(ConnectionStatus::Connecting);
                }
            }
        }

        self.status.set(ConnectionStatus::Disconnected);
    }
}
