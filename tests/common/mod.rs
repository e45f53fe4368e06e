//! Shared test fixtures: an in-process MQTT 3.1.1 broker and an HTTP sink.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use bifrost::topic::topic_matches_filter;

/// Poll `condition` every 10ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// =============================================================================
// Fake MQTT broker
// =============================================================================

/// A connected client as seen by the fake broker
struct Session {
    filters: Arc<Mutex<Vec<String>>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct BrokerState {
    sessions: Mutex<Vec<Session>>,
    connects: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    disconnects: AtomicUsize,
    reject_subscriptions: AtomicBool,
    credentials: Mutex<Option<(String, String)>>,
    client_ids: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
}

/// Just enough of an MQTT 3.1.1 broker to drive a bridge: CONNECT,
/// SUBSCRIBE, UNSUBSCRIBE, PINGREQ and DISCONNECT from clients, QoS 0
/// PUBLISH towards them.
pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read_half, mut write_half) = stream.into_split();
                let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
                let filters = Arc::new(Mutex::new(Vec::new()));

                let writer = tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if write_half.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                });

                let reader = tokio::spawn(serve_client(
                    read_half,
                    tx.clone(),
                    filters.clone(),
                    accept_state.clone(),
                ));

                accept_state.sessions.lock().push(Session {
                    filters,
                    outbound: tx,
                    tasks: vec![writer, reader],
                });
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Only accept clients presenting these credentials
    pub fn require_credentials(&self, username: &str, password: &str) {
        *self.state.credentials.lock() = Some((username.to_string(), password.to_string()));
    }

    /// Answer SUBSCRIBE with a failure return code
    pub fn reject_subscriptions(&self, reject: bool) {
        self.state
            .reject_subscriptions
            .store(reject, Ordering::SeqCst);
    }

    /// Publish at QoS 0 to every client with a matching subscription.
    /// Returns the number of clients the message went to.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        let frame = encode_publish(topic, payload);
        let sessions = self.state.sessions.lock();
        let mut delivered = 0;
        for session in sessions.iter() {
            let matches = session
                .filters
                .lock()
                .iter()
                .any(|filter| topic_matches_filter(topic, filter));
            if matches && session.outbound.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop every client connection without a DISCONNECT
    pub fn kick_all(&self) {
        for session in self.state.sessions.lock().drain(..) {
            for task in session.tasks {
                task.abort();
            }
        }
    }

    /// Number of subscriptions currently held across all clients
    pub fn active_subscriptions(&self) -> usize {
        self.state
            .sessions
            .lock()
            .iter()
            .filter(|s| !s.outbound.is_closed())
            .map(|s| s.filters.lock().len())
            .sum()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.state.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.state.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Filters named in UNSUBSCRIBE packets, in arrival order
    pub fn unsubscribed_filters(&self) -> Vec<String> {
        self.state.unsubscribed.lock().clone()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.client_ids.lock().clone()
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kick_all();
    }
}

async fn serve_client<R: AsyncRead + Unpin>(
    mut reader: R,
    outbound: mpsc::UnboundedSender<Bytes>,
    filters: Arc<Mutex<Vec<String>>>,
    state: Arc<BrokerState>,
) {
    while let Some((header, body)) = read_packet(&mut reader).await {
        match header >> 4 {
            // CONNECT
            1 => {
                let connect = parse_connect(&body);
                state.client_ids.lock().push(connect.client_id.clone());

                let allowed = match &*state.credentials.lock() {
                    Some((user, pass)) => {
                        connect.username.as_deref() == Some(user.as_str())
                            && connect.password.as_deref() == Some(pass.as_str())
                    }
                    None => true,
                };

                if !allowed {
                    // Return code 5: not authorized
                    let _ = outbound.send(Bytes::from_static(&[0x20, 0x02, 0x00, 0x05]));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    break;
                }

                state.connects.fetch_add(1, Ordering::SeqCst);
                let _ = outbound.send(Bytes::from_static(&[0x20, 0x02, 0x00, 0x00]));
            }
            // SUBSCRIBE
            8 => {
                let packet_id = [body[0], body[1]];
                let mut cursor = 2;
                let mut codes = Vec::new();
                let reject = state.reject_subscriptions.load(Ordering::SeqCst);

                while cursor < body.len() {
                    let filter = read_string(&body, &mut cursor);
                    cursor += 1; // requested QoS
                    if reject {
                        codes.push(0x80);
                    } else {
                        filters.lock().push(filter);
                        codes.push(0x00);
                    }
                }

                if !reject {
                    state.subscribes.fetch_add(1, Ordering::SeqCst);
                }

                let mut frame = BytesMut::new();
                frame.put_u8(0x90);
                frame.put_u8(2 + codes.len() as u8);
                frame.put_slice(&packet_id);
                frame.put_slice(&codes);
                let _ = outbound.send(frame.freeze());
            }
            // UNSUBSCRIBE
            10 => {
                let packet_id = [body[0], body[1]];
                let mut cursor = 2;
                while cursor < body.len() {
                    let filter = read_string(&body, &mut cursor);
                    filters.lock().retain(|f| *f != filter);
                    state.unsubscribed.lock().push(filter);
                }
                state.unsubscribes.fetch_add(1, Ordering::SeqCst);
                let _ = outbound.send(Bytes::copy_from_slice(&[
                    0xB0,
                    0x02,
                    packet_id[0],
                    packet_id[1],
                ]));
            }
            // PINGREQ
            12 => {
                let _ = outbound.send(Bytes::from_static(&[0xD0, 0x00]));
            }
            // DISCONNECT
            14 => {
                state.disconnects.fetch_add(1, Ordering::SeqCst);
                break;
            }
            _ => {}
        }
    }

    filters.lock().clear();
}

struct ConnectPacket {
    client_id: String,
    username: Option<String>,
    password: Option<String>,
}

fn parse_connect(body: &[u8]) -> ConnectPacket {
    let mut cursor = 0;
    let _protocol_name = read_string(body, &mut cursor);
    let _level = body[cursor];
    let flags = body[cursor + 1];
    cursor += 4; // level, flags, keep alive

    let client_id = read_string(body, &mut cursor);
    if flags & 0x04 != 0 {
        let _will_topic = read_string(body, &mut cursor);
        let _will_message = read_string(body, &mut cursor);
    }
    let username = (flags & 0x80 != 0).then(|| read_string(body, &mut cursor));
    let password = (flags & 0x40 != 0).then(|| read_string(body, &mut cursor));

    ConnectPacket {
        client_id,
        username,
        password,
    }
}

fn read_string(body: &[u8], cursor: &mut usize) -> String {
    let len = u16::from_be_bytes([body[*cursor], body[*cursor + 1]]) as usize;
    let start = *cursor + 2;
    *cursor = start + len;
    String::from_utf8_lossy(&body[start..start + len]).into_owned()
}

async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Option<(u8, Vec<u8>)> {
    let header = reader.read_u8().await.ok()?;

    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await.ok()?;
        remaining |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return None;
        }
    }

    let mut body = vec![0u8; remaining];
    reader.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

fn encode_publish(topic: &str, payload: &[u8]) -> Bytes {
    let mut remaining = 2 + topic.len() + payload.len();
    let mut frame = BytesMut::with_capacity(remaining + 5);
    frame.put_u8(0x30);
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        frame.put_u8(byte);
        if remaining == 0 {
            break;
        }
    }
    frame.put_u16(topic.len() as u16);
    frame.put_slice(topic.as_bytes());
    frame.put_slice(payload);
    frame.freeze()
}

// =============================================================================
// HTTP sink
// =============================================================================

/// A request as received by the sink
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Default)]
struct SinkState {
    requests: Mutex<Vec<RecordedRequest>>,
    status: AtomicU16,
    delay_ms: AtomicU16,
}

/// HTTP server that records every request and answers with a configurable status
pub struct HttpSink {
    addr: SocketAddr,
    state: Arc<SinkState>,
    task: JoinHandle<()>,
}

impl HttpSink {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(SinkState::default());
        state.status.store(200, Ordering::SeqCst);

        let server_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let io = TokioIo::new(stream);
                let state = server_state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(record(req, &state).await) }
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Self { addr, state, task }
    }

    /// URL of `path` on this sink
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn respond_with(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    /// Delay every response by `delay`
    pub fn delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u16, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Wait until at least `count` requests arrived
    pub async fn wait_for_requests(&self, count: usize, limit: Duration) -> Vec<RecordedRequest> {
        wait_until(limit, || self.state.requests.lock().len() >= count).await;
        self.requests()
    }
}

impl Drop for HttpSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn record(req: Request<hyper::body::Incoming>, state: &SinkState) -> Response<Full<Bytes>> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    state.requests.lock().push(RecordedRequest {
        method,
        path,
        content_type,
        body,
    });

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
    }

    let status = StatusCode::from_u16(state.status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Full::new(Bytes::from_static(b"{\"accepted\":true}")));
    *response.status_mut() = status;
    response
}
