use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use neuroband_types::{
    BackendState, BridgeError, BridgeResult, CloseInfo, ConnectionPhase, ConnectionState,
    StreamEvent, StreamMessage,
};
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::telemetry::TelemetryBuffers;

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsConnection, Message>;
type WsSource = SplitStream<WsConnection>;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CLOSE_CODE_NO_STATUS: u16 = 1005;
const CLOSE_CODE_ABNORMAL: u16 = 1006;

struct StreamShared {
    state: RwLock<ConnectionState>,
    sink: Mutex<Option<WsSink>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    last_rx: SyncRwLock<Instant>,
    events: broadcast::Sender<StreamEvent>,
    buffers: Arc<TelemetryBuffers>,
}

/// One streaming connection at a time: candidate endpoints tried strictly in
/// order, no self-scheduled reconnect. Recovery is driven by the caller
/// (usually the next polling tick), which keeps reconnect storms impossible.
pub struct StreamClient {
    config: StreamConfig,
    backend_state: watch::Receiver<BackendState>,
    shared: Arc<StreamShared>,
}

impl StreamClient {
    pub fn new(
        config: StreamConfig,
        backend_state: watch::Receiver<BackendState>,
        buffers: Arc<TelemetryBuffers>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            backend_state,
            shared: Arc::new(StreamShared {
                state: RwLock::new(ConnectionState::idle()),
                sink: Mutex::new(None),
                tasks: SyncMutex::new(Vec::new()),
                last_rx: SyncRwLock::new(Instant::now()),
                events,
                buffers,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.state.read().await.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.shared.state.read().await.is_open()
    }

    /// Attempts the candidate endpoints in priority order; the first to open
    /// wins. A no-op while a connection is open or an attempt is in flight,
    /// and while the backend is not Running.
    pub async fn connect(&self) -> BridgeResult<()> {
        if *self.backend_state.borrow() != BackendState::Running {
            info!("Backend not running, skipping stream connect");
            return Ok(());
        }

        {
            let mut state = self.shared.state.write().await;
            match state.phase {
                ConnectionPhase::Open => {
                    debug!("Stream already open, ignoring connect");
                    return Ok(());
                }
                ConnectionPhase::Connecting => {
                    debug!("Stream connect already in flight, ignoring");
                    return Ok(());
                }
                ConnectionPhase::Idle | ConnectionPhase::Closed => {
                    state.phase = ConnectionPhase::Connecting;
                }
            }
        }

        let timeout = self.config.connect_timeout();
        for url in self.config.endpoints() {
            debug!("Trying stream endpoint {}", url);
            match tokio::time::timeout(timeout, connect_async(&url)).await {
                Ok(Ok((socket, _response))) => {
                    self.on_open(&url, socket).await;
                    return Ok(());
                }
                Ok(Err(e)) => warn!("Stream endpoint {} failed: {}", url, e),
                Err(_) => warn!("Stream endpoint {} timed out after {:?}", url, timeout),
            }
        }

        {
            let mut state = self.shared.state.write().await;
            state.phase = ConnectionPhase::Closed;
            state.endpoint = None;
            state.attempts += 1;
        }
        let _ = self.shared.events.send(StreamEvent::Connectivity(false));
        Err(BridgeError::Stream("All stream endpoints failed".into()))
    }

    async fn on_open(&self, url: &str, socket: WsConnection) {
        info!("Stream open at {}", url);
        let (sink, source) = socket.split();
        *self.shared.sink.lock().await = Some(sink);
        *self.shared.last_rx.write() = Instant::now();

        {
            let mut state = self.shared.state.write().await;
            state.phase = ConnectionPhase::Open;
            state.endpoint = Some(url.to_string());
            state.attempts = 0;
        }
        let _ = self.shared.events.send(StreamEvent::Connectivity(true));

        {
            let mut tasks = self.shared.tasks.lock();
            tasks.push(tokio::spawn(read_loop(self.shared.clone(), source)));
            tasks.push(tokio::spawn(health_loop(
                self.shared.clone(),
                Duration::from_secs(self.config.health_check_interval_secs),
            )));
            tasks.push(tokio::spawn(liveness_loop(
                self.shared.clone(),
                Duration::from_secs(self.config.liveness_interval_secs),
                Duration::from_secs(self.config.liveness_timeout_secs),
            )));
        }

        self.shared
            .send_message(&StreamMessage::Handshake {
                client: "neuroband-bridge".to_string(),
            })
            .await;
    }

    /// Fire-and-forget: a message sent while the stream is not open is
    /// dropped with a log line, never an error.
    pub async fn send(&self, message: &StreamMessage) {
        self.shared.send_message(message).await;
    }

    /// Tears the connection down and resets to Idle with a zeroed attempt
    /// counter.
    pub async fn disconnect(&self) {
        info!("Disconnecting stream");
        self.shared.abort_tasks();

        {
            let mut sink_guard = self.shared.sink.lock().await;
            if let Some(mut sink) = sink_guard.take() {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        }

        let was_connected = {
            let mut state = self.shared.state.write().await;
            let was = matches!(
                state.phase,
                ConnectionPhase::Open | ConnectionPhase::Connecting
            );
            *state = ConnectionState::idle();
            was
        };
        if was_connected {
            let _ = self.shared.events.send(StreamEvent::Connectivity(false));
        }
    }
}

impl StreamShared {
    async fn send_message(&self, message: &StreamMessage) {
        if !self.state.read().await.is_open() {
            warn!("Dropping stream message, connection not open");
            return;
        }

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode stream message: {}", e);
                return;
            }
        };

        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Stream send failed: {}", e);
                }
            }
            None => warn!("Dropping stream message, connection not open"),
        }
    }

    /// A text frame carries one or more newline-delimited JSON objects.
    fn handle_frame(&self, text: &str) {
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<StreamMessage>(line) {
                Ok(message) => {
                    if let Some((sensor, samples)) = message.sensor_batch() {
                        self.buffers.append(sensor, samples.to_vec());
                        let _ = self.events.send(StreamEvent::Batch {
                            sensor,
                            samples: samples.to_vec(),
                        });
                    }
                    let _ = self.events.send(StreamEvent::Message(message));
                }
                Err(e) => debug!("Ignoring undecodable stream frame: {}", e),
            }
        }
    }

    /// Idempotent close path shared by the reader, the liveness check and
    /// remote close frames. Aborting our own tasks comes last: it cancels
    /// the calling task at its next await point.
    async fn handle_close(self: &Arc<Self>, code: u16, reason: String) {
        {
            let mut state = self.state.write().await;
            if state.phase != ConnectionPhase::Open {
                return;
            }
            state.phase = ConnectionPhase::Closed;
            state.endpoint = None;
            state.last_close = Some(CloseInfo {
                code,
                reason: reason.clone(),
            });
        }
        info!("Stream closed (code {}): {}", code, reason);

        *self.sink.lock().await = None;
        let _ = self.events.send(StreamEvent::Connectivity(false));
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

async fn read_loop(shared: Arc<StreamShared>, mut source: WsSource) {
    while let Some(result) = source.next().await {
        match result {
            Ok(Message::Text(text)) => {
                *shared.last_rx.write() = Instant::now();
                shared.handle_frame(&text);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                *shared.last_rx.write() = Instant::now();
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((CLOSE_CODE_NO_STATUS, String::new()));
                shared.handle_close(code, reason).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Stream read error: {}", e);
                shared.handle_close(CLOSE_CODE_ABNORMAL, e.to_string()).await;
                return;
            }
        }
    }

    shared
        .handle_close(CLOSE_CODE_ABNORMAL, "stream ended".to_string())
        .await;
}

async fn health_loop(shared: Arc<StreamShared>, period: Duration) {
    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        shared.send_message(&StreamMessage::HealthCheck).await;
    }
}

async fn liveness_loop(shared: Arc<StreamShared>, period: Duration, timeout: Duration) {
    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stale = shared.last_rx.read().elapsed();
        if stale > timeout {
            warn!("No stream traffic for {:?}, dropping connection", stale);
            shared
                .handle_close(CLOSE_CODE_ABNORMAL, "liveness timeout".to_string())
                .await;
            return;
        }
    }
}
