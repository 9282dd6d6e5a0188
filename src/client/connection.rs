//! Client side of the broker WebSocket.
//!
//! `BrokerConnection` owns at most one socket at a time and hides reconnects
//! from its users:
//! - requests are sent as invocations and resolved by the broker's
//!   `completion` frame, bounded by the invocation timeout
//! - other broker frames are fanned out to observers (in order, off the read
//!   loop) and to the `frames()` broadcast
//! - when the socket drops, it retries on the configured delay schedule and
//!   runs every observer's `on_connected` hook before reporting `Connected`
//!   again
//!
//! Cloning is cheap; all clones share the same socket.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::transport::message::{ClientMessage, Invocation, ServerMessage};
use crate::utils::error::ClientError;

type WsReader = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Delays used between reconnect attempts when none are configured.
pub const DEFAULT_RECONNECT_DELAYS: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }

    /// `Ok(true)` when requests can be sent now, `Ok(false)` when a start is
    /// needed, and an error when starting must not be attempted.
    pub fn ready(self) -> Result<bool, ClientError> {
        match self {
            ConnectionState::Connected => Ok(true),
            ConnectionState::Reconnecting => Err(ClientError::Reconnecting),
            ConnectionState::Closed => Err(ClientError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => Ok(false),
        }
    }
}

/// Lifecycle notifications published on [`BrokerConnection::lifecycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Reconnecting,
    Reconnected,
    Closed,
}

/// Hooks into a [`BrokerConnection`].
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// Runs after every successful (re)connect, before the connection is
    /// reported as `Connected`. Use [`BrokerConnection::invoke_unchecked`]
    /// here; `invoke` would be refused.
    async fn on_connected(&self, _connection: &BrokerConnection) -> Result<(), ClientError> {
        Ok(())
    }

    /// Called for every broker frame that is not a completion.
    async fn on_frame(&self, _frame: &ServerMessage) {}
}

#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    reconnect_delays: Vec<Duration>,
    invocation_timeout: Duration,
    state: AtomicU8,
    // bumped for every socket; a reader only cleans up its own socket
    generation: AtomicU64,
    writer: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    pending: DashMap<String, oneshot::Sender<Result<(), String>>>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    lifecycle: broadcast::Sender<ConnectionEvent>,
    frames: broadcast::Sender<ServerMessage>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_options(url, DEFAULT_RECONNECT_DELAYS.to_vec(), DEFAULT_INVOCATION_TIMEOUT)
    }

    pub fn with_options(
        url: impl Into<String>,
        reconnect_delays: Vec<Duration>,
        invocation_timeout: Duration,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(16);
        let (frames, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                reconnect_delays,
                invocation_timeout,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                generation: AtomicU64::new(0),
                writer: Mutex::new(None),
                pending: DashMap::new(),
                observers: RwLock::new(Vec::new()),
                lifecycle,
                frames,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Lifecycle events: reconnecting, reconnected, closed.
    pub fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.lifecycle.subscribe()
    }

    /// Every broker frame except completions, e.g. `onPublishFailed`.
    pub fn frames(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.frames.subscribe()
    }

    /// Open the socket and run the `on_connected` hooks.
    ///
    /// A hook failure abandons the new socket and is returned to the caller.
    pub async fn start(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(ClientError::Closed),
            _ => {}
        }

        self.inner.set_state(ConnectionState::Connecting);
        let generation = match self.inner.clone().open_socket().await {
            Ok(generation) => generation,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                error!(url = %self.inner.url, error = %e, "failed to connect to broker");
                return Err(e);
            }
        };

        if let Err(e) = self.inner.run_connected_hooks().await {
            self.inner.abandon_socket();
            self.inner.set_state(ConnectionState::Disconnected);
            error!(url = %self.inner.url, error = %e, "broker handshake failed");
            return Err(e);
        }

        // a concurrent close or an early disconnect wins
        if self.inner.is_current(generation)
            && self
                .inner
                .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            if self.inner.is_current(generation)
                || !self
                    .inner
                    .transition(ConnectionState::Connected, ConnectionState::Disconnected)
            {
                info!(url = %self.inner.url, "connected to broker");
                return Ok(());
            }
            // the socket died between the check and the transition
            return Err(ClientError::NotConnected);
        }
        self.inner
            .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
        match self.state() {
            ConnectionState::Closed => Err(ClientError::Closed),
            ConnectionState::Reconnecting => Err(ClientError::Reconnecting),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Send a request and wait for the broker to complete it.
    pub async fn invoke(&self, message: ClientMessage) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Connected => self.invoke_unchecked(message).await,
            ConnectionState::Reconnecting => Err(ClientError::Reconnecting),
            ConnectionState::Closed => Err(ClientError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => Err(ClientError::NotConnected),
        }
    }

    /// Like [`invoke`](Self::invoke) but only requires an open socket.
    pub async fn invoke_unchecked(&self, message: ClientMessage) -> Result<(), ClientError> {
        let operation = message.operation();
        let invocation_id = Uuid::new_v4().to_string();
        let text = serde_json::to_string(&Invocation {
            invocation_id: Some(invocation_id.clone()),
            message,
        })?;

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let writer = self.inner.writer().ok_or(ClientError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(invocation_id.clone(), tx);

        // a disconnect that cleared `pending` before the insert would leave
        // this invocation waiting for the full timeout
        if !self.inner.is_current(generation) || writer.send(WsMessage::text(text)).is_err() {
            self.inner.pending.remove(&invocation_id);
            return Err(ClientError::NotConnected);
        }

        match tokio::time::timeout(self.inner.invocation_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(ClientError::Remote {
                operation: operation.to_string(),
                message,
            }),
            // the socket went away and took the pending invocation with it
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                self.inner.pending.remove(&invocation_id);
                Err(ClientError::InvocationTimeout {
                    operation: operation.to_string(),
                    timeout_ms: self.inner.invocation_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Stop the connection for good. Only the first call has an effect.
    pub fn close(&self) {
        let previous = self
            .inner
            .state
            .swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if previous == ConnectionState::Closed as u8 {
            return;
        }

        self.inner.cancel.cancel();
        self.inner.abandon_socket();
        let _ = self.inner.lifecycle.send(ConnectionEvent::Closed);
        info!(url = %self.inner.url, "broker connection closed");
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Set `state` unless the connection has been closed.
    fn set_state(&self, state: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ConnectionState::Closed as u8).then_some(state as u8)
            })
            .is_ok()
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// True while the socket opened as `generation` is still the live one.
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation && self.writer().is_some()
    }

    fn writer(&self) -> Option<mpsc::UnboundedSender<WsMessage>> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Close the current socket without triggering a reconnect, and fail
    /// every invocation still waiting on it.
    fn abandon_socket(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let _ = writer.send(WsMessage::Close(None));
        }
        self.pending.clear();
    }

    async fn run_connected_hooks(self: &Arc<Self>) -> Result<(), ClientError> {
        let connection = BrokerConnection { inner: self.clone() };
        for observer in self.observers() {
            observer.on_connected(&connection).await?;
        }
        Ok(())
    }

    // Boxed because the reader task it spawns may call back into it.
    // Resolves to the generation of the new socket.
    fn open_socket(self: Arc<Self>) -> BoxFuture<'static, Result<u64, ClientError>> {
        async move {
            let (ws_stream, _) =
                connect_async(self.url.as_str())
                    .await
                    .map_err(|e| ClientError::Connect {
                        url: self.url.clone(),
                        source: Box::new(e),
                    })?;

            let (mut ws_sender, ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    let closing = msg.is_close();
                    if let Err(e) = ws_sender.send(msg).await {
                        debug!("failed to send frame to broker: {e}");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            });

            tokio::spawn(self.clone().read_loop(ws_receiver, generation));
            Ok(generation)
        }
        .boxed()
    }

    async fn read_loop(self: Arc<Self>, mut ws_receiver: WsReader, generation: u64) {
        // observers run on their own task so a handler may invoke the broker
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let observers = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = dispatch_rx.recv().await {
                for observer in observers.observers() {
                    observer.on_frame(&frame).await;
                }
            }
        });

        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.handle_frame(&text, &dispatch_tx),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("broker read error: {e}");
                    break;
                }
            }
        }
        drop(dispatch_tx);

        self.on_disconnected(generation).await;
    }

    fn handle_frame(&self, text: &str, dispatch: &mpsc::UnboundedSender<ServerMessage>) {
        let frame = match serde_json::from_str::<ServerMessage>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unreadable frame from broker: {e}");
                return;
            }
        };

        match frame {
            ServerMessage::Completion {
                invocation_id,
                error,
            } => {
                if let Some((_, waiter)) = self.pending.remove(&invocation_id) {
                    let _ = waiter.send(error.map_or(Ok(()), Err));
                } else {
                    debug!(invocation_id, "completion for unknown invocation");
                }
            }
            frame => {
                match &frame {
                    ServerMessage::PublishFailed { topic, error } => {
                        warn!(topic, error, "broker reported failed publish")
                    }
                    ServerMessage::Error { message } => warn!(error = %message, "broker reported error"),
                    _ => {}
                }
                let _ = self.frames.send(frame.clone());
                let _ = dispatch.send(frame);
            }
        }
    }

    async fn on_disconnected(self: Arc<Self>, generation: u64) {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // socket was replaced or abandoned on purpose
            return;
        }

        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.pending.clear();

        // Only a socket that was reported as connected starts a reconnect
        // loop. A socket lost while `start` or a running loop still owns it
        // is noticed there through the generation check.
        if self.cancel.is_cancelled()
            || !self.transition(ConnectionState::Connected, ConnectionState::Reconnecting)
        {
            return;
        }
        warn!(url = %self.url, "lost broker connection, reconnecting");
        let _ = self.lifecycle.send(ConnectionEvent::Reconnecting);

        self.reconnect().await;
    }

    async fn reconnect(self: Arc<Self>) {
        for (attempt, delay) in self.reconnect_delays.iter().enumerate() {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(*delay) => {}
            }

            let generation = match self.clone().open_socket().await {
                Ok(generation) => generation,
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
                    continue;
                }
            };

            if let Err(e) = self.run_connected_hooks().await {
                warn!(attempt = attempt + 1, error = %e, "reconnect hook failed");
                self.abandon_socket();
                continue;
            }
            if !self.is_current(generation) {
                warn!(attempt = attempt + 1, "socket lost during reconnect handshake");
                continue;
            }

            if !self.transition(ConnectionState::Reconnecting, ConnectionState::Connected) {
                // closed meanwhile
                return;
            }
            if !self.is_current(generation) {
                if self.transition(ConnectionState::Connected, ConnectionState::Reconnecting) {
                    // lost right before the transition; its reader left the retry to us
                    warn!(attempt = attempt + 1, "socket lost during reconnect handshake");
                    continue;
                }
                // its reader already started a new reconnect loop
                return;
            }
            info!(url = %self.url, attempt = attempt + 1, "reconnected to broker");
            let _ = self.lifecycle.send(ConnectionEvent::Reconnected);
            return;
        }

        error!(url = %self.url, "giving up reconnecting to broker");
        if self.set_state(ConnectionState::Disconnected) {
            let _ = self.lifecycle.send(ConnectionEvent::Closed);
        }
    }
}
