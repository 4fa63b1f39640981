//! Gateway session: one long-lived, self-reconnecting WebSocket connection.
//!
//! ```text
//!  Disconnected ─start─► Connecting ─► AwaitingChallenge ─► Handshaking ─► Connected
//!        ▲                    ▲                                  │               │
//!       stop                  │                          reject / close        close
//!        │                    │                                  ▼               ▼
//!     Closing              Backoff ◄─────────────────────────────┴───────────────┘
//! ```
//!
//! The session owns a single driver task. Every close fails all outstanding
//! requests with a [`TransportError`] and schedules a reconnect; nothing short
//! of [`GatewaySession::stop`] ends the loop.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::{BackoffConfig, ReconnectScheduler};
use crate::dispatch::{EventBus, PendingCalls, SequenceStats, SequenceTracker};
use crate::error::{GatewayError, Result, TransportError};
use crate::events::{GatewayEvent, NODE_INVOKE_EVENT, NodeInvokeRequest};
use crate::methods::{CONNECT, wire_method};
use crate::protocol::{
    CHALLENGE_EVENT, Frame, HandshakeConfig, HelloOk, RequestFrame, decode_frame, encode_frame,
};

const NORMAL_CLOSE: u16 = 1000;
const ABNORMAL_CLOSE: u16 = 1006;
const HANDSHAKE_FAILED_REASON: &str = "connect failed";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub handshake: HandshakeConfig,
    pub backoff: BackoffConfig,
    /// How long to wait for `connect.challenge` before connecting without a nonce
    pub challenge_grace: Duration,
    /// Bound on opening the socket and on the handshake response
    pub handshake_timeout: Duration,
    /// Bound on `request()`; `None` waits until the response or a close
    pub request_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            handshake: HandshakeConfig::default(),
            backoff: BackoffConfig::default(),
            challenge_grace: Duration::from_millis(750),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Handshaking,
    Connected,
    Closing,
    Backoff,
}

/// Lifecycle notifications. Called on the session task, so implementations
/// must not block; spawn if work needs to await the session.
pub trait SessionObserver: Send + Sync {
    fn on_connected(&self, hello: &HelloOk) {
        let _ = hello;
    }

    fn on_close(&self, code: u16, reason: &str) {
        let _ = (code, reason);
    }

    fn on_error(&self, error: &GatewayError) {
        let _ = error;
    }

    fn on_reconnect_scheduled(&self, delay: Duration, attempt: u32) {
        let _ = (delay, attempt);
    }
}

struct SessionShared {
    config: SessionConfig,
    pending: PendingCalls,
    sequence: SequenceTracker,
    events: EventBus,
    status: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    hello: RwLock<Option<HelloOk>>,
    device_token: RwLock<Option<String>>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

struct DriverHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum ConnectionEnd {
    ConnectFailed(TransportError),
    HandshakeFailed(GatewayError),
    Closed { code: u16, reason: String },
    Stopped,
}

pub struct GatewaySession {
    shared: Arc<SessionShared>,
    driver: Mutex<Option<DriverHandle>>,
}

impl GatewaySession {
    pub fn new(config: SessionConfig) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(SessionShared {
                config,
                pending: PendingCalls::default(),
                sequence: SequenceTracker::default(),
                events: EventBus::default(),
                status,
                outbound: Mutex::new(None),
                hello: RwLock::new(None),
                device_token: RwLock::new(None),
                observers: RwLock::new(Vec::new()),
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Spawn the driver task. Calling `start` on a running session is a no-op.
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            warn!("Gateway session already running");
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(drive(shared, stop_rx));
        *driver = Some(DriverHandle { stop, handle });
        info!(url = %self.shared.config.url, "Gateway session started");
    }

    /// Stop the session: fail every outstanding request, close the socket and
    /// cancel any pending reconnect.
    pub async fn stop(&self) {
        let Some(driver) = self.driver.lock().take() else {
            return;
        };

        self.shared.set_state(ConnectionState::Closing);
        let _ = driver.stop.send(true);
        self.shared.outbound.lock().take();
        let failed = self.shared.pending.fail_all(&TransportError::Stopped);
        if failed > 0 {
            debug!(failed, "Failed pending requests on stop");
        }

        if let Err(err) = driver.handle.await
            && !err.is_cancelled()
        {
            warn!(error = %err, "Gateway driver task ended abnormally");
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Gateway session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.driver.lock().is_some()
    }

    /// Send a request using its semantic method name and wait for the response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let sender = self
            .shared
            .outbound
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let id = Uuid::new_v4().to_string();
        let wire = wire_method(method);
        let text = encode_frame(&Frame::Req(RequestFrame {
            id: id.clone(),
            method: wire.to_string(),
            params,
        }))?;

        let rx = self.shared.pending.register(&id);
        if sender.send(Message::Text(text.into())).is_err() {
            self.shared.pending.cancel(&id);
            return Err(TransportError::NotConnected.into());
        }
        debug!(id = %id, method = %wire, "Gateway request sent");

        let received = match self.shared.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.shared.pending.cancel(&id);
                    return Err(TransportError::Timeout.into());
                }
            },
            None => rx.await,
        };

        received.unwrap_or(Err(GatewayError::Transport(TransportError::Stopped)))
    }

    /// [`request`](Self::request) with typed params and response.
    pub async fn request_as<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = self.request(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.shared.observers.write().push(observer);
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.status.borrow()
    }

    /// Hello payload from the most recent successful handshake.
    pub fn hello(&self) -> Option<HelloOk> {
        self.shared.hello.read().clone()
    }

    pub fn sequence_stats(&self) -> SequenceStats {
        self.shared.sequence.stats()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            let _ = driver.stop.send(true);
            driver.handle.abort();
        }
    }
}

impl SessionShared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.status.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Gateway state changed");
        }
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers.read().clone()
    }

    fn handle_text(&self, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Ignoring malformed gateway frame");
                return;
            }
        };

        match frame {
            Frame::Res(response) => {
                self.pending.complete(response);
            }
            // Invoke frames never reach subscribers or the watermark, even undecodable ones.
            Frame::Event(frame) if frame.event == NODE_INVOKE_EVENT => {
                match serde_json::from_value::<NodeInvokeRequest>(frame.payload) {
                    Ok(request) => self.events.dispatch_node_invoke(&request),
                    Err(err) => warn!(error = %err, "Dropping malformed node invoke frame"),
                }
            }
            Frame::Event(frame) => {
                let event = GatewayEvent::decode(&frame);
                if let Some(seq) = frame.seq {
                    self.sequence.observe(seq);
                }
                if let GatewayEvent::Shutdown(shutdown) = &event {
                    info!(
                        reason = shutdown.reason.as_deref().unwrap_or("unspecified"),
                        restart_expected_ms = shutdown.restart_expected_ms,
                        "Gateway announced shutdown"
                    );
                }
                self.events.publish(&event);
            }
            Frame::Req(request) => {
                debug!(method = %request.method, "Ignoring request frame from gateway");
            }
        }
    }

    fn handshake_succeeded(&self, hello: HelloOk) {
        if let Some(token) = hello.device_token() {
            *self.device_token.write() = Some(token.to_string());
        }
        self.sequence.reset_watermark();
        info!(
            protocol = hello.protocol,
            methods = hello.features.methods.len(),
            "Gateway handshake complete"
        );
        *self.hello.write() = Some(hello.clone());

        for observer in self.observers() {
            observer.on_connected(&hello);
        }
    }

    fn connection_ended(&self, end: &ConnectionEnd) {
        self.outbound.lock().take();

        match end {
            ConnectionEnd::ConnectFailed(err) => {
                warn!(error = %err, "Gateway connection failed");
                let err = GatewayError::Transport(err.clone());
                for observer in self.observers() {
                    observer.on_error(&err);
                }
            }
            ConnectionEnd::HandshakeFailed(err) => {
                warn!(error = %err, "Gateway handshake failed");
                for observer in self.observers() {
                    observer.on_error(err);
                }
            }
            ConnectionEnd::Stopped => {}
            ConnectionEnd::Closed { code, reason } => {
                let failed = self.pending.fail_all(&TransportError::Closed {
                    code: *code,
                    reason: reason.clone(),
                });
                info!(code, reason = %reason, failed, "Gateway connection closed");
                for observer in self.observers() {
                    observer.on_close(*code, reason);
                }
            }
        }
    }
}

async fn drive(shared: Arc<SessionShared>, mut stop: watch::Receiver<bool>) {
    let mut backoff = ReconnectScheduler::new(shared.config.backoff.clone());

    loop {
        let end = connect_once(&shared, &mut backoff, &mut stop).await;
        shared.connection_ended(&end);
        if matches!(end, ConnectionEnd::Stopped) || *stop.borrow() {
            break;
        }

        shared.set_state(ConnectionState::Backoff);
        let delay = backoff.next_delay();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempts(),
            "Scheduling gateway reconnect"
        );
        for observer in shared.observers() {
            observer.on_reconnect_scheduled(delay, backoff.attempts());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_requested(&mut stop) => break,
        }
    }

    shared.outbound.lock().take();
    debug!("Gateway driver exited");
}

async fn connect_once(
    shared: &Arc<SessionShared>,
    backoff: &mut ReconnectScheduler,
    stop: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let config = &shared.config;
    shared.set_state(ConnectionState::Connecting);

    let opened = tokio::select! {
        opened = tokio::time::timeout(config.handshake_timeout, connect_async(config.url.as_str())) => opened,
        _ = stop_requested(stop) => return ConnectionEnd::Stopped,
    };
    let ws = match opened {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(err)) => return ConnectionEnd::ConnectFailed(TransportError::Connect(err.to_string())),
        Err(_) => {
            return ConnectionEnd::ConnectFailed(TransportError::Connect(
                "timed out opening socket".to_string(),
            ));
        }
    };
    let (mut write, mut read) = ws.split();

    shared.set_state(ConnectionState::AwaitingChallenge);
    let challenge = tokio::select! {
        challenge = await_challenge(&mut read, config.challenge_grace) => challenge,
        _ = stop_requested(stop) => return ConnectionEnd::Stopped,
    };
    let nonce = match challenge {
        Ok(nonce) => nonce,
        Err(end) => return end,
    };

    shared.set_state(ConnectionState::Handshaking);
    let result = tokio::select! {
        result = handshake(shared, &mut write, &mut read, nonce) => result,
        _ = stop_requested(stop) => return ConnectionEnd::Stopped,
    };
    let hello = match result {
        Ok(hello) => hello,
        Err(err) => {
            let _ = write
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: HANDSHAKE_FAILED_REASON.into(),
                })))
                .await;
            return ConnectionEnd::HandshakeFailed(err);
        }
    };

    backoff.reset();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *shared.outbound.lock() = Some(out_tx);
    shared.handshake_succeeded(hello);
    shared.set_state(ConnectionState::Connected);

    let (code, reason) = loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(err) = write.send(message).await {
                        break (ABNORMAL_CLOSE, err.to_string());
                    }
                }
                None => {
                    let _ = write.send(client_close()).await;
                    break (NORMAL_CLOSE, "client stopped".to_string());
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => shared.handle_text(text),
                    Err(_) => warn!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => break close_details(frame),
                Some(Ok(_)) => {}
                Some(Err(err)) => break (ABNORMAL_CLOSE, err.to_string()),
                None => break (ABNORMAL_CLOSE, "connection ended".to_string()),
            },
            _ = stop_requested(stop) => {
                let _ = write.send(client_close()).await;
                break (NORMAL_CLOSE, "client stopped".to_string());
            }
        }
    };

    shared.outbound.lock().take();
    drop(out_rx);
    ConnectionEnd::Closed { code, reason }
}

/// Wait up to `grace` for a challenge. `Ok(None)` means none arrived.
async fn await_challenge(
    read: &mut WsRead,
    grace: Duration,
) -> std::result::Result<Option<String>, ConnectionEnd> {
    let deadline = Instant::now() + grace;
    loop {
        let Ok(next) = tokio::time::timeout_at(deadline, read.next()).await else {
            debug!("No connect challenge within grace window");
            return Ok(None);
        };

        match next {
            Some(Ok(Message::Text(text))) => match challenge_nonce(text.as_str()) {
                Some(nonce) => {
                    debug!("Received connect challenge");
                    return Ok(Some(nonce));
                }
                None => debug!("Ignoring frame received before handshake"),
            },
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = close_details(frame);
                return Err(ConnectionEnd::Closed { code, reason });
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                return Err(ConnectionEnd::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: err.to_string(),
                });
            }
            None => {
                return Err(ConnectionEnd::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: "connection ended".to_string(),
                });
            }
        }
    }
}

fn challenge_nonce(text: &str) -> Option<String> {
    match decode_frame(text).ok()? {
        Frame::Event(event) if event.event == CHALLENGE_EVENT => event
            .payload
            .get("nonce")
            .and_then(Value::as_str)
            .filter(|nonce| !nonce.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

async fn handshake(
    shared: &SessionShared,
    write: &mut WsWrite,
    read: &mut WsRead,
    nonce: Option<String>,
) -> Result<HelloOk> {
    let device_token = shared.device_token.read().clone();
    let params = shared.config.handshake.connect_params(nonce, device_token);
    let id = Uuid::new_v4().to_string();
    let text = encode_frame(&Frame::Req(RequestFrame {
        id: id.clone(),
        method: wire_method(CONNECT).to_string(),
        params: serde_json::to_value(params)?,
    }))?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|err| TransportError::Send(err.to_string()))?;

    let deadline = Instant::now() + shared.config.handshake_timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, read.next())
            .await
            .map_err(|_| TransportError::Timeout)?;

        match next {
            Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                Ok(Frame::Res(response)) if response.id == id => {
                    return match response.into_result() {
                        Ok(Value::Null) => Ok(HelloOk::default()),
                        Ok(payload) => serde_json::from_value(payload).map_err(|err| {
                            GatewayError::Protocol(format!("invalid hello payload: {}", err))
                        }),
                        Err(shape) => Err(GatewayError::Handshake {
                            code: shape.code,
                            message: shape.message,
                        }),
                    };
                }
                Ok(_) => debug!("Ignoring frame received during handshake"),
                Err(err) => warn!(error = %err, "Ignoring malformed frame during handshake"),
            },
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = close_details(frame);
                return Err(TransportError::Closed { code, reason }.into());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                return Err(TransportError::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: err.to_string(),
                }
                .into());
            }
            None => {
                return Err(TransportError::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: "connection ended".to_string(),
                }
                .into());
            }
        }
    }
}

/// Resolves once stop is signalled or the session handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

fn client_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "client stopped".into(),
    }))
}

fn close_details(frame: Option<CloseFrame>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
        None => (NORMAL_CLOSE, String::new()),
    }
}
