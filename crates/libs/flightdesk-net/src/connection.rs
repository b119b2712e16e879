//! WebSocket session lifecycle for one endpoint.
//!
//! A [`ConnectionManager`] owns at most one driver task. The driver connects,
//! runs the session (heartbeat, frame dispatch, outbound commands) and, after
//! an abnormal close, reconnects with backoff until the attempt budget is spent.

mod driver;
mod ws;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffScheduler;
use crate::config::ConnectionConfig;
use crate::envelope::Envelope;
use crate::error::NetError;
use crate::subscription::{SubscriptionRegistry, TopicReceiver};

pub use ws::{WsConnector, WsTransport};

/// WebSocket close code for an intentional shutdown. Closes with this code
/// never trigger a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Reconnect bookkeeping; `attempts` resets on every successful connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempts: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Connected { session: u64 },
    ConnectFailed { error: NetError },
    Disconnected { code: Option<u16> },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The attempt budget is spent; nothing happens until `connect()`.
    Abandoned { attempts: u32 },
    Error { error: NetError },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<u16>),
}

/// One live, bidirectional text channel.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), NetError>;

    /// `None` once the peer has gone away without a close frame.
    async fn next_frame(&mut self) -> Option<Result<Frame, NetError>>;

    async fn close(&mut self, code: u16) -> Result<(), NetError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>, NetError>;
}

enum Command {
    Send { text: String, reply: oneshot::Sender<bool> },
}

struct SessionControl {
    generation: u64,
    stop: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    retry_now: Arc<Notify>,
    task: JoinHandle<()>,
}

struct Inner {
    endpoint: String,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    backoff: BackoffScheduler,
    network: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    registry: Mutex<SubscriptionRegistry>,
    session: Mutex<Option<SessionControl>>,
    /// Held across `disconnect` so no new driver starts before the old one
    /// has joined.
    lifecycle: AsyncMutex<()>,
    last_pong: Mutex<Option<Instant>>,
    attempts: AtomicU32,
    generation: AtomicU64,
    sessions: AtomicU64,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().expect("subscription registry mutex poisoned")
    }

    fn session(&self) -> MutexGuard<'_, Option<SessionControl>> {
        self.session.lock().expect("session control mutex poisoned")
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::debug!("connection: endpoint={} state {previous:?} -> {next:?}", self.endpoint);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn record_pong(&self) {
        *self.last_pong.lock().expect("last pong mutex poisoned") = Some(Instant::now());
    }

    /// Drops the session control if it still belongs to `generation`.
    fn release(&self, generation: u64) {
        let mut session = self.session();
        if session.as_ref().is_some_and(|control| control.generation == generation) {
            *session = None;
        }
    }
}

/// Keeps one endpoint connected and routes its messages to topic subscribers.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: impl Into<String>,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        backoff: BackoffScheduler,
        network: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.into(),
                config,
                connector,
                backoff,
                network,
                state,
                events,
                registry: Mutex::new(SubscriptionRegistry::new()),
                session: Mutex::new(None),
                lifecycle: AsyncMutex::new(()),
                last_pong: Mutex::new(None),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                sessions: AtomicU64::new(0),
            }),
        }
    }

    /// Connects, or joins the attempt already under way.
    ///
    /// On failure the error is returned and, with `auto_reconnect`, the
    /// driver keeps retrying in the background.
    pub async fn connect(&self) -> Result<(), NetError> {
        let mut events = {
            let _lifecycle = self.inner.lifecycle.lock().await;
            let events = self.inner.events.subscribe();
            if self.state() == ConnectionState::Connected {
                return Ok(());
            }
            self.start_or_wake();
            events
        };

        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Connected { .. }) => return Ok(()),
                Ok(ConnectionEvent::ConnectFailed { error }) => return Err(error),
                Ok(ConnectionEvent::Abandoned { attempts }) => {
                    return Err(NetError::connection(format!("gave up after {attempts} attempts")))
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("connection: connect waiter lagged skipped={skipped}");
                    if self.state() == ConnectionState::Connected {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(NetError::connection("connection manager closed"))
                }
            }
        }
    }

    fn start_or_wake(&self) {
        let mut session = self.inner.session();
        if let Some(control) = session.as_ref() {
            if self.state() == ConnectionState::Disconnected {
                // Driver is waiting out a backoff delay.
                control.retry_now.notify_one();
            }
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let stop = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let retry_now = Arc::new(Notify::new());
        self.inner.attempts.store(0, Ordering::Relaxed);
        self.inner.set_state(ConnectionState::Connecting);
        log::info!("connection: starting endpoint={} generation={generation}", self.inner.endpoint);

        let task = tokio::spawn(driver::run(
            Arc::clone(&self.inner),
            generation,
            stop.clone(),
            commands_rx,
            Arc::clone(&retry_now),
        ));
        *session = Some(SessionControl { generation, stop, commands: commands_tx, retry_now, task });
    }

    /// Writes `envelope` to the live session. `false` when not connected or
    /// when the write fails.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        if !self.is_connected() {
            log::debug!("connection: send while not connected endpoint={}", self.inner.endpoint);
            return false;
        }
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(err) => {
                log::warn!("connection: unencodable envelope kind={} err={err}", envelope.kind);
                return false;
            }
        };
        let commands = match self.inner.session().as_ref() {
            Some(control) => control.commands.clone(),
            None => return false,
        };
        let (reply, delivered) = oneshot::channel();
        if commands.send(Command::Send { text, reply }).is_err() {
            return false;
        }
        delivered.await.unwrap_or(false)
    }

    /// Closes the session with [`NORMAL_CLOSURE`] and drops every subscription.
    ///
    /// Heartbeat and reconnect timers are gone by the time this returns.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let control = self.inner.session().take();
        let Some(control) = control else {
            self.inner.registry().clear();
            self.inner.set_state(ConnectionState::Disconnected);
            return;
        };
        self.inner.set_state(ConnectionState::Closing);
        control.stop.cancel();
        if let Err(err) = control.task.await {
            log::warn!("connection: driver task failed endpoint={} err={err}", self.inner.endpoint);
        }
        if self.inner.session().is_some() {
            log::warn!("connection: session restarted during teardown endpoint={}", self.inner.endpoint);
            return;
        }
        self.inner.registry().clear();
        self.inner.set_state(ConnectionState::Disconnected);
        log::info!("connection: disconnected endpoint={} generation={}", self.inner.endpoint, control.generation);
    }

    /// Local subscription; `None` when `topic` already has a subscriber.
    pub fn subscribe(&self, topic: &str) -> Option<TopicReceiver> {
        self.inner.registry().subscribe(topic)
    }

    /// Subscribes locally and registers `filter` with the server, now if
    /// connected and again after every reconnect.
    pub async fn subscribe_remote(&self, topic: &str, filter: Value) -> Option<TopicReceiver> {
        let rx = self.inner.registry().subscribe_remote(topic, filter.clone())?;
        if self.is_connected() && !self.send(&Envelope::subscribe(topic, &filter)).await {
            log::warn!("connection: remote subscribe not delivered topic={topic}");
        }
        Some(rx)
    }

    /// Invokes `callback` for every message on `topic` until unsubscribed.
    pub fn subscribe_with<F>(&self, topic: &str, callback: F) -> bool
    where
        F: Fn(Envelope) + Send + 'static,
    {
        let Some(mut rx) = self.subscribe(topic) else {
            return false;
        };
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                callback(message);
            }
        });
        true
    }

    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.inner.registry().unsubscribe(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.registry().topics()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_pong(&self) -> Option<Instant> {
        *self.inner.last_pong.lock().expect("last pong mutex poisoned")
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        ReconnectState {
            attempts: self.reconnect_attempts(),
            max_attempts: self.inner.config.max_reconnect_attempts,
            base_delay: self.inner.config.reconnect_base_delay(),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut session) = self.inner.session.lock() {
            if let Some(control) = session.take() {
                control.stop.cancel();
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
