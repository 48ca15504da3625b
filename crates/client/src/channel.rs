//! Resilient streaming channel for one job or batch.
//!
//! [`TransportChannel`] owns at most one live WebSocket connection. It
//! spawns a task that connects, sends the literal keepalive on a fixed
//! interval, decodes frames and dispatches them to registered handlers.
//! When the connection drops without the owner asking for it, the task
//! reconnects with a linearly growing delay until the attempt cap is
//! reached, then reports a terminal [`TransportError`].
//!
//! Handlers are registered per [`EventKind`], plus [`EventKind::All`]
//! which sees every event. A panicking handler is logged and skipped;
//! it never stops dispatch to the remaining handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ChannelKind, StreamClient, WsStream};
use crate::protocol::{parse_frame, ControlFrame, Frame, StreamMessage};
use crate::reconnect::{delay_for_attempt, ReconnectConfig};

/// Default period between keepalive requests.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on waiting for the close handshake during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Mirrors the underlying socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Tunables for a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Keepalive period actually used; a zero period means the default.
    pub fn effective_keepalive(&self) -> Duration {
        if self.keepalive_interval.is_zero() {
            DEFAULT_KEEPALIVE_INTERVAL
        } else {
            self.keepalive_interval
        }
    }
}

/// Terminal transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Gave up after {attempts} reconnect attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },
}

impl TransportError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::AttemptsExhausted { attempts, .. } => *attempts,
        }
    }
}

/// Everything a channel reports to its handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The socket opened (also after a successful reconnect).
    Opened,
    /// A decoded data frame.
    Message(StreamMessage),
    /// The socket dropped; attempt `attempt` fires after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnecting gave up. No further events follow.
    Failed(TransportError),
}

/// Selector for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Opened,
    Connected,
    Progress,
    Complete,
    Error,
    BatchProgress,
    BatchComplete,
    Reconnecting,
    TransportFailed,
    /// Wildcard: receives every event after the specific handlers.
    All,
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Opened => EventKind::Opened,
            Self::Message(msg) => match msg {
                StreamMessage::Connected { .. } => EventKind::Connected,
                StreamMessage::Progress { .. } => EventKind::Progress,
                StreamMessage::Complete { .. } => EventKind::Complete,
                StreamMessage::Error { .. } => EventKind::Error,
                StreamMessage::BatchProgress { .. } => EventKind::BatchProgress,
                StreamMessage::BatchComplete { .. } => EventKind::BatchComplete,
            },
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Failed(_) => EventKind::TransportFailed,
        }
    }
}

/// Callback invoked for dispatched events.
pub type EventHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Token returned by [`TransportChannel::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HandlerRegistry {
    next_id: u64,
    handlers: Vec<(HandlerId, EventKind, EventHandler)>,
}

impl HandlerRegistry {
    fn add(&mut self, kind: EventKind, handler: EventHandler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.handlers.push((id, kind, handler));
        id
    }

    fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(hid, _, _)| *hid != id);
        self.handlers.len() != before
    }

    /// Handlers for `kind` first, then wildcard handlers.
    fn matching(&self, kind: EventKind) -> Vec<EventHandler> {
        let specific = self
            .handlers
            .iter()
            .filter(|(_, k, _)| *k == kind && kind != EventKind::All);
        let wildcard = self.handlers.iter().filter(|(_, k, _)| *k == EventKind::All);
        specific
            .chain(wildcard)
            .map(|(_, _, h)| Arc::clone(h))
            .collect()
    }
}

/// Shared handle to the registry; cloned into the connection task.
#[derive(Clone, Default)]
struct Dispatcher {
    registry: Arc<RwLock<HandlerRegistry>>,
}

impl Dispatcher {
    fn dispatch(&self, channel_id: &str, event: &ChannelEvent) {
        // Snapshot so handlers may call on/off without deadlocking.
        let handlers = match self.registry.read() {
            Ok(registry) => registry.matching(event.kind()),
            Err(poisoned) => poisoned.into_inner().matching(event.kind()),
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(
                    channel_id,
                    kind = ?event.kind(),
                    "Channel event handler panicked; continuing dispatch",
                );
            }
        }
    }

    fn with_registry<T>(&self, f: impl FnOnce(&mut HandlerRegistry) -> T) -> T {
        match self.registry.write() {
            Ok(mut registry) => f(&mut registry),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportChannel
// ---------------------------------------------------------------------------

/// Bookkeeping for the currently running connection task.
struct ActiveRun {
    channel_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One streaming connection per job or batch, with keepalive and
/// linear-backoff reconnection.
///
/// Owned by whoever asked for it; dropping the channel tears the
/// connection down just like [`disconnect`](Self::disconnect).
pub struct TransportChannel {
    client: StreamClient,
    config: ChannelConfig,
    dispatcher: Dispatcher,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    /// Bumped by every `connect`; only the current run may write state.
    generation: Arc<AtomicU64>,
    /// Parent token; every run gets a child of it.
    shutdown: CancellationToken,
    run: Option<ActiveRun>,
}

impl TransportChannel {
    /// Create an idle channel.
    ///
    /// Cancelling `shutdown` stops any run started from this channel.
    pub fn new(client: StreamClient, config: ChannelConfig, shutdown: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            client,
            config,
            dispatcher: Dispatcher::default(),
            state_tx: Arc::new(state_tx),
            generation: Arc::new(AtomicU64::new(0)),
            shutdown,
            run: None,
        }
    }

    /// Register `handler` for events of `kind` (or every event for
    /// [`EventKind::All`]).
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.dispatcher
            .with_registry(|registry| registry.add(kind, Arc::new(handler)))
    }

    /// Unregister a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        self.dispatcher.with_registry(|registry| registry.remove(id))
    }

    /// Open the connection for `channel_id`.
    ///
    /// Any previous run of this channel is stopped first, so there is
    /// never more than one live connection per channel.
    pub fn connect(&mut self, channel_id: impl Into<String>, kind: ChannelKind) {
        let channel_id = channel_id.into();
        if let Some(previous) = self.run.take() {
            tracing::debug!(
                old = %previous.channel_id,
                new = %channel_id,
                "Replacing active streaming run",
            );
            previous.cancel.cancel();
        }

        // Bumped under the watch lock so a stale run's final write cannot
        // interleave with this run's first one.
        let mut generation = 0;
        self.state_tx.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *state = ConnectionState::Connecting;
        });

        let cancel = self.shutdown.child_token();
        let ctx = RunContext {
            client: self.client.clone(),
            config: self.config.clone(),
            dispatcher: self.dispatcher.clone(),
            state_tx: Arc::clone(&self.state_tx),
            current_generation: Arc::clone(&self.generation),
            generation,
            channel_id: channel_id.clone(),
            kind,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run_channel(ctx));

        self.run = Some(ActiveRun {
            channel_id,
            cancel,
            task,
        });
    }

    /// Close the connection and suppress reconnection.
    ///
    /// Idempotent. Cancels the keepalive ticker and any pending
    /// reconnect delay, and clears every registered handler.
    pub fn disconnect(&mut self) {
        if let Some(run) = self.run.take() {
            tracing::debug!(channel_id = %run.channel_id, "Disconnecting streaming channel");
            run.cancel.cancel();
            if run.task.is_finished() {
                self.state_tx.send_replace(ConnectionState::Closed);
            } else {
                // The task writes `Closed` on exit; never overwrite that.
                self.state_tx.send_modify(|state| {
                    if *state != ConnectionState::Closed {
                        *state = ConnectionState::Closing;
                    }
                });
            }
        }
        self.dispatcher
            .with_registry(|registry| registry.handlers.clear());
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Id of the currently addressed job or batch, if any.
    pub fn channel_id(&self) -> Option<&str> {
        self.run.as_ref().map(|run| run.channel_id.as_str())
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

struct RunContext {
    client: StreamClient,
    config: ChannelConfig,
    dispatcher: Dispatcher,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    channel_id: String,
    kind: ChannelKind,
    cancel: CancellationToken,
}

impl RunContext {
    /// Publish `state` unless a newer run has replaced this one.
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if self.current_generation.load(Ordering::Acquire) != self.generation {
                tracing::trace!(channel_id = %self.channel_id, ?state, "Ignoring state from replaced run");
                return false;
            }
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn emit(&self, event: ChannelEvent) {
        self.dispatcher.dispatch(&self.channel_id, &event);
    }
}

/// How one connected session ended.
enum SessionEnd {
    Cancelled,
    Dropped(String),
}

/// Core loop: connect -> run session -> wait -> reconnect, until
/// cancelled or the attempt cap is exceeded.
async fn run_channel(ctx: RunContext) {
    let mut attempt: u32 = 0;

    loop {
        ctx.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            result = ctx.client.connect(&ctx.channel_id, ctx.kind) => result,
        };

        let last_error = match connected {
            Ok(ws_stream) => {
                attempt = 0;
                ctx.set_state(ConnectionState::Open);
                tracing::info!(
                    channel_id = %ctx.channel_id,
                    kind = %ctx.kind,
                    "Streaming channel open",
                );
                ctx.emit(ChannelEvent::Opened);

                match run_session(ws_stream, &ctx).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Dropped(reason) => reason,
                }
            }
            Err(e) => {
                tracing::warn!(
                    channel_id = %ctx.channel_id,
                    error = %e,
                    "Streaming connection failed",
                );
                e.to_string()
            }
        };

        if ctx.cancel.is_cancelled() {
            break;
        }
        ctx.set_state(ConnectionState::Closed);

        attempt += 1;
        let Some(delay) = delay_for_attempt(attempt, &ctx.config.reconnect) else {
            let attempts = attempt - 1;
            tracing::error!(
                channel_id = %ctx.channel_id,
                attempts,
                "Reconnect attempts exhausted",
            );
            ctx.emit(ChannelEvent::Failed(TransportError::AttemptsExhausted {
                attempts,
                last_error,
            }));
            break;
        };

        tracing::info!(
            channel_id = %ctx.channel_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect",
        );
        ctx.emit(ChannelEvent::Reconnecting { attempt, delay });

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    ctx.set_state(ConnectionState::Closed);
    tracing::debug!(channel_id = %ctx.channel_id, "Streaming channel task exited");
}

/// Drive one open connection: keepalive on a timer, frames as they
/// arrive, until the socket drops or the run is cancelled.
async fn run_session(ws_stream: WsStream, ctx: &RunContext) -> SessionEnd {
    let (mut sink, mut stream) = ws_stream.split();
    let period = ctx.config.effective_keepalive();
    if ctx.config.keepalive_interval.is_zero() {
        tracing::warn!(
            channel_id = %ctx.channel_id,
            fallback_ms = period.as_millis() as u64,
            "Zero keepalive interval configured; using default",
        );
    }
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                ctx.set_state(ConnectionState::Closing);
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                return SessionEnd::Cancelled;
            }
            _ = keepalive.tick() => {
                let ping = Message::Text(ControlFrame::Ping.as_str().to_string());
                if let Err(e) = sink.send(ping).await {
                    tracing::warn!(channel_id = %ctx.channel_id, error = %e, "Keepalive send failed");
                    return SessionEnd::Dropped(e.to_string());
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&text, ctx),
                    Some(Ok(Message::Binary(_))) => {
                        tracing::trace!(channel_id = %ctx.channel_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(channel_id = %ctx.channel_id, ?frame, "Server closed streaming channel");
                        return SessionEnd::Dropped("closed by server".to_string());
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::error!(channel_id = %ctx.channel_id, error = %e, "WebSocket receive error");
                        return SessionEnd::Dropped(e.to_string());
                    }
                    None => {
                        tracing::info!(channel_id = %ctx.channel_id, "WebSocket stream exhausted");
                        return SessionEnd::Dropped("stream ended".to_string());
                    }
                }
            }
        }
    }
}

/// Decode one text frame and dispatch data frames.
fn handle_text(text: &str, ctx: &RunContext) {
    match parse_frame(text) {
        Ok(Frame::Control(control)) => {
            tracing::trace!(channel_id = %ctx.channel_id, frame = control.as_str(), "Keepalive frame");
        }
        Ok(Frame::Data(msg)) => {
            tracing::trace!(channel_id = %ctx.channel_id, msg_type = msg.type_name(), "Stream message");
            ctx.emit(ChannelEvent::Message(msg));
        }
        Err(e) => {
            tracing::warn!(
                channel_id = %ctx.channel_id,
                error = %e,
                raw_message = %text,
                "Dropping malformed stream message",
            );
        }
    }
}
