//! ConnectionManager: the push channel to the chat server.
//!
//! One logical bidirectional channel per manager. `connect` starts a
//! supervisor task that performs the authenticated handshake, pumps frames
//! in both directions and, when the channel drops while a credential is
//! still present, reconnects with exponential backoff. State transitions are
//! published on a `watch` channel and are the only failure signal.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackoffConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::Credential;
use crate::protocol::{ClientEvent, EventKind, ServerEvent};

pub mod memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = SyncResult<String>> + Send>>;

/// An established channel: text frames out, text frames in. The stream ends
/// when the peer closes the channel.
pub struct ChannelIo {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Establishes authenticated channels. Swappable so the manager can be
/// driven without a network in tests.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, credential: &Credential) -> SyncResult<ChannelIo>;
}

/// WebSocket connector; the credential travels as a bearer header on the
/// upgrade request.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, credential: &Credential) -> SyncResult<ChannelIo> {
        use tungstenite::client::IntoClientRequest;
        use tungstenite::http::header::{AUTHORIZATION, HeaderValue};

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(SyncError::from_tungstenite)?;
        let bearer = HeaderValue::from_str(&credential.bearer())
            .map_err(|e| SyncError::Channel(format!("invalid credential header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(SyncError::from_tungstenite)?;
        let (ws_write, ws_read) = ws_stream.split();

        let sink = ws_write
            .with(|text: String| async move {
                Ok::<_, tungstenite::Error>(tungstenite::Message::Text(text.into()))
            })
            .sink_map_err(SyncError::from_tungstenite);

        let stream = ws_read
            .take_while(|msg| {
                futures::future::ready(!matches!(msg, Ok(tungstenite::Message::Close(_))))
            })
            .filter_map(|msg| {
                futures::future::ready(match msg {
                    Ok(tungstenite::Message::Text(text)) => Some(Ok(text.to_string())),
                    // Ping/pong are answered by tungstenite; binary frames are not part
                    // of the protocol.
                    Ok(_) => None,
                    Err(e) => Some(Err(SyncError::from_tungstenite(e))),
                })
            });

        Ok(ChannelIo {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Receives inbound events of the kinds it was registered for, in arrival
/// order.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

type Subscribers = Arc<Mutex<HashMap<EventKind, Vec<mpsc::UnboundedSender<ServerEvent>>>>>;

struct Session {
    cancel: CancellationToken,
}

/// Owns the push channel. Construct one per signed-in user.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    backoff: BackoffConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscribers: Subscribers,
    /// Writer queue of the live channel, present only while connected.
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    session: Mutex<Option<Session>>,
    /// Bumped on every connect and disconnect. A supervisor may only touch
    /// shared state while the generation it was started with is current.
    generation: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, backoff: BackoffConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            backoff,
            state_tx: Arc::new(state_tx),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            outbound: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Start (or restart with a new credential) the channel. Never fails:
    /// handshake errors show up as `Disconnected` followed by retries.
    pub async fn connect(&self, credential: Credential) {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            debug!("replacing existing channel session");
            previous.cancel.cancel();
        }

        self.generation.fetch_add(1, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        *session = Some(Session {
            cancel: cancel.clone(),
        });
        tokio::spawn(self.supervisor(credential, cancel).run());
    }

    fn supervisor(&self, credential: Credential, cancel: CancellationToken) -> Supervisor {
        Supervisor {
            connector: self.connector.clone(),
            backoff: self.backoff.clone(),
            state_tx: self.state_tx.clone(),
            subscribers: self.subscribers.clone(),
            outbound: self.outbound.clone(),
            generation: self.generation.clone(),
            owned_generation: self.generation.load(Ordering::SeqCst),
            credential,
            cancel,
        }
    }

    /// Tear down the channel and stop reconnecting. Idempotent.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = session.take() {
            session.cancel.cancel();
            info!("channel disconnected");
        }
        *self.outbound.lock().await = None;
        set_state(&self.state_tx, ConnectionState::Disconnected, || true);
    }

    /// Fire-and-forget publish. Returns false (and does nothing) unless the
    /// channel is connected; there is no outbound queue.
    pub async fn send(&self, event: &ClientEvent) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!(event = event.name(), "not connected, dropping send");
            return false;
        }
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to encode event");
                return false;
            }
        };
        match self.outbound.lock().await.as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Register for one kind of inbound event.
    pub async fn subscribe(&self, kind: EventKind) -> EventSubscription {
        self.subscribe_many(&[kind]).await
    }

    /// Register one subscription for several kinds; events of those kinds
    /// reach it in their relative arrival order.
    pub async fn subscribe_many(&self, kinds: &[EventKind]) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().await;
        for kind in kinds {
            subscribers.entry(*kind).or_default().push(tx.clone());
        }
        EventSubscription { rx }
    }
}

/// Publish `new` if it differs from the current state and `allowed` still
/// holds. `allowed` is evaluated under the watch lock, so it is ordered
/// against every other write.
fn set_state(
    state_tx: &watch::Sender<ConnectionState>,
    new: ConnectionState,
    allowed: impl FnOnce() -> bool,
) {
    state_tx.send_if_modified(|current| {
        if *current == new || !allowed() {
            false
        } else {
            debug!(from = ?*current, to = ?new, "connection state");
            *current = new;
            true
        }
    });
}

/// Background task owning one credential's connect/reconnect loop.
struct Supervisor {
    connector: Arc<dyn Connector>,
    backoff: BackoffConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscribers: Subscribers,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    generation: Arc<AtomicU64>,
    owned_generation: u64,
    credential: Credential,
    cancel: CancellationToken,
}

impl Supervisor {
    /// False once a later connect or a disconnect took over shared state.
    fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.owned_generation
    }

    fn set_state(&self, new: ConnectionState) {
        set_state(&self.state_tx, new, || self.is_current());
    }

    async fn run(self) {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.credential) => result,
            };

            match result {
                Ok(io) => {
                    info!("channel connected");
                    attempt = 0;
                    self.run_session(io).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    info!("channel lost, will attempt reconnection");
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!(attempt = attempt, error = %e, "channel connect failed");
                }
            }

            if self.backoff.exhausted(attempt) {
                warn!(attempts = attempt, "giving up on channel reconnection");
                break;
            }

            let delay = self.backoff.delay(attempt);
            attempt += 1;
            debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("channel supervisor stopped");
    }

    /// Pump frames until the channel drops or the session is cancelled.
    /// Leaves the state at `Disconnected` on drop.
    async fn run_session(&self, io: ChannelIo) {
        let ChannelIo {
            mut sink,
            mut stream,
        } = io;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        {
            let mut outbound = self.outbound.lock().await;
            if !self.is_current() {
                return;
            }
            *outbound = Some(tx.clone());
        }
        self.set_state(ConnectionState::Connected);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
                Some(frame) = rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        warn!(error = %e, "channel write error");
                        break;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(text)) => self.dispatch(&text).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "channel read error");
                            break;
                        }
                        None => {
                            info!("channel closed by server");
                            break;
                        }
                    }
                }
            }
        }

        // Unpublish the writer before announcing the drop so no send can be
        // accepted into a dead queue.
        {
            let mut outbound = self.outbound.lock().await;
            if outbound.as_ref().is_some_and(|current| current.same_channel(&tx)) {
                *outbound = None;
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn dispatch(&self, text: &str) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "ignoring malformed channel frame");
                return;
            }
        };

        let kind = event.kind();
        let mut subscribers = self.subscribers.lock().await;
        if let Some(list) = subscribers.get_mut(&kind) {
            list.retain(|tx| tx.send(event.clone()).is_ok());
            debug!(event = %kind, receivers = list.len(), "dispatched channel event");
        }
    }
}
