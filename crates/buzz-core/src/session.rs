//! Broker sessions.
//!
//! A [`BrokerSession`] owns one connection to one endpoint. It connects,
//! subscribes to the endpoint's topic, runs every inbound message through the
//! endpoint's filter and reports what happened on the shared event stream.
//!
//! ```text
//!          start()            connected + subscribed
//!   Idle ───────────▶ Connecting ───────────────▶ Connected
//!    ▲                    │                           │
//!    │   connect failed   │                stop()     │ transport dropped
//!    ├────────────────────┘                   ▼       │
//!    │                                  Disconnecting │
//!    ├────────────────────────────────────────┘       │
//!    └────────────────────────────────────────────────┘
//! ```
//!
//! A failed connect is not retried; the caller decides whether to start again.

use crate::endpoint::{EndpointId, EndpointSpec, DEFAULT_MAX_MESSAGE_LENGTH};
use crate::event::{truncate_chars, EventSender, SessionEvent};
use crate::filter::MessageFilter;
use mqttbuzz_transport::{
    traits::DEFAULT_KEEP_ALIVE, Connection, InboundMessage, Transport, TransportError,
};

pub use mqttbuzz_transport::traits::DEFAULT_CONNECT_TIMEOUT;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Default bound on waiting for a session to acknowledge `stop()`.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason reported when a session is force-released.
pub const FORCE_RELEASED_REASON: &str = "stop timed out; connection force-released";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not connected.
    Idle,
    /// Connection attempt in flight.
    Connecting,
    /// Connected and subscribed.
    Connected,
    /// Closing the connection.
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// How a call to [`BrokerSession::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The session was already idle; nothing happened.
    AlreadyIdle,
    /// The session closed its connection and reported `Disconnected`.
    Disconnected,
    /// The session did not acknowledge in time and was torn down.
    ForceReleased,
}

/// Session tuning shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Bound on waiting for a session to stop.
    pub stop_timeout: Duration,
    /// Forwarded bodies are truncated to this many characters.
    pub max_message_length: usize,
}

impl SessionSettings {
    /// Creates settings with default values.
    ///
    /// Defaults:
    /// - Connect timeout: 60 s
    /// - Keep-alive: 60 s
    /// - Stop timeout: 5 s
    /// - Maximum message length: 256 characters
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the keep-alive interval.
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the stop timeout.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Sets the maximum forwarded message length.
    #[must_use]
    pub const fn with_max_message_length(mut self, length: usize) -> Self {
        self.max_message_length = length;
        self
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// The runtime connection object for one endpoint.
pub struct BrokerSession {
    id: EndpointId,
    spec: Arc<EndpointSpec>,
    transport: Arc<dyn Transport>,
    events: EventSender,
    settings: SessionSettings,
    state: Arc<watch::Sender<SessionState>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<MessageFilter>>,
    /// Filter parked between runs.
    filter: Option<MessageFilter>,
}

impl BrokerSession {
    /// Create an idle session for `spec`.
    #[must_use]
    pub fn new(
        spec: EndpointSpec,
        transport: Arc<dyn Transport>,
        events: EventSender,
        settings: SessionSettings,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let filter = MessageFilter::new(spec.filter);
        Self {
            id: spec.id(),
            spec: Arc::new(spec),
            transport,
            events,
            settings,
            state: Arc::new(state),
            stop_tx: None,
            task: None,
            filter: Some(filter),
        }
    }

    /// Get the endpoint identity.
    #[must_use]
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Get the endpoint specification.
    #[must_use]
    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Begin connecting.
    ///
    /// Returns `false` without doing anything if the session is not idle.
    pub async fn start(&mut self) -> bool {
        let running = self.task.as_ref().is_some_and(|t| !t.is_finished());
        if running && self.state() != SessionState::Idle {
            debug!(endpoint = %self.id, state = %self.state(), "Start ignored, session is running");
            return false;
        }
        self.reclaim().await;

        let filter = self
            .filter
            .take()
            .unwrap_or_else(|| MessageFilter::new(self.spec.filter));
        let (stop_tx, stop_rx) = oneshot::channel();

        self.state.send_replace(SessionState::Connecting);
        let run = SessionRun {
            id: self.id.clone(),
            spec: Arc::clone(&self.spec),
            transport: Arc::clone(&self.transport),
            events: self.events.clone(),
            settings: self.settings.clone(),
            state: Arc::clone(&self.state),
            filter,
        };
        self.task = Some(tokio::spawn(run.run(stop_rx)));
        self.stop_tx = Some(stop_tx);
        true
    }

    /// Disconnect, waiting at most `timeout` for the session to go idle.
    ///
    /// Idempotent: stopping an idle session does nothing. A session that does
    /// not acknowledge in time is aborted and reported as disconnected with
    /// [`FORCE_RELEASED_REASON`].
    pub async fn stop(&mut self, timeout: Duration) -> StopOutcome {
        let Some(mut task) = self.task.take() else {
            return StopOutcome::AlreadyIdle;
        };
        let stop_tx = self.stop_tx.take();

        // Idle is the last thing a run reports, so the task is finishing.
        if task.is_finished() || self.state() == SessionState::Idle {
            if let Ok(filter) = task.await {
                self.filter = Some(filter);
            }
            return StopOutcome::AlreadyIdle;
        }

        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(filter)) => {
                self.filter = Some(filter);
                StopOutcome::Disconnected
            }
            Ok(Err(e)) => {
                warn!(endpoint = %self.id, error = %e, "Session task failed while stopping");
                self.force_release();
                StopOutcome::ForceReleased
            }
            Err(_) => {
                task.abort();
                match task.await {
                    // Finished between the timeout and the abort.
                    Ok(filter) => {
                        self.filter = Some(filter);
                        StopOutcome::Disconnected
                    }
                    Err(_) => {
                        warn!(
                            endpoint = %self.id,
                            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                            "Session did not stop in time, force-released"
                        );
                        self.force_release();
                        StopOutcome::ForceReleased
                    }
                }
            }
        }
    }

    /// Stop with the configured stop timeout.
    pub async fn stop_default(&mut self) -> StopOutcome {
        let timeout = self.settings.stop_timeout;
        self.stop(timeout).await
    }

    fn force_release(&mut self) {
        let event = SessionEvent::disconnected(&self.spec, Some(FORCE_RELEASED_REASON.into()));
        if self.events.send(event).is_err() {
            debug!(endpoint = %self.id, "Event stream closed");
        }
        self.state.send_replace(SessionState::Idle);
    }

    /// Recover the filter from a run that has already ended.
    async fn reclaim(&mut self) {
        self.stop_tx = None;
        if let Some(task) = self.task.take() {
            if let Ok(filter) = task.await {
                self.filter = Some(filter);
            }
        }
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Whether `stop()` has been called (or the session dropped).
fn stop_pending(stop_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty))
}

enum Step {
    Stop,
    Received(Result<Option<InboundMessage>, TransportError>),
}

/// One connect episode, running on its own task.
struct SessionRun {
    id: EndpointId,
    spec: Arc<EndpointSpec>,
    transport: Arc<dyn Transport>,
    events: EventSender,
    settings: SessionSettings,
    state: Arc<watch::Sender<SessionState>>,
    filter: MessageFilter,
}

impl SessionRun {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) -> MessageFilter {
        let target = self
            .spec
            .connect_target(self.settings.keep_alive, self.settings.connect_timeout);
        debug!(
            endpoint = %self.id,
            transport = self.transport.name(),
            "Connecting"
        );

        // A connect attempt in flight is not interrupted by stop().
        let attempt = tokio::time::timeout(
            self.settings.connect_timeout,
            self.transport.connect(&target),
        )
        .await;
        let mut conn = match attempt {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return self.connect_failed(e, stop_pending(&mut stop_rx)),
            Err(_) => {
                return self.connect_failed(TransportError::Timeout, stop_pending(&mut stop_rx))
            }
        };

        if stop_pending(&mut stop_rx) {
            return self.shutdown(conn).await;
        }

        if let Err(e) = conn.subscribe(&self.spec.topic).await {
            let _ = conn.close().await;
            return self.connect_failed(e, stop_pending(&mut stop_rx));
        }

        self.state.send_replace(SessionState::Connected);
        info!(endpoint = %self.id, connection = %conn.id(), "Connected");
        self.emit(SessionEvent::connected(&self.spec));

        let reason = loop {
            let step = tokio::select! {
                biased;
                _ = &mut stop_rx => Step::Stop,
                received = conn.recv() => Step::Received(received),
            };
            match step {
                Step::Stop => return self.shutdown(conn).await,
                Step::Received(Ok(Some(message))) => self.handle_message(message),
                Step::Received(Ok(None)) => break "connection closed by broker".to_string(),
                Step::Received(Err(e)) => break e.to_string(),
            }
        };

        warn!(endpoint = %self.id, reason = %reason, "Connection lost");
        self.emit(SessionEvent::disconnected(&self.spec, Some(reason)));
        self.state.send_replace(SessionState::Idle);
        self.filter
    }

    fn handle_message(&mut self, message: InboundMessage) {
        let text = match std::str::from_utf8(&message.payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(endpoint = %self.id, topic = %message.topic, error = %e, "Dropping non-UTF-8 payload");
                return;
            }
        };

        if !self.filter.admit(&self.id, text, Instant::now()) {
            trace!(endpoint = %self.id, "Message filtered");
            return;
        }

        let body = truncate_chars(text, self.settings.max_message_length).to_string();
        self.emit(SessionEvent::forwarded(&self.spec, body));
    }

    /// Report a failed connect. With a stop pending, the stop is acknowledged
    /// with `Disconnected` as well.
    fn connect_failed(self, error: TransportError, stopping: bool) -> MessageFilter {
        warn!(endpoint = %self.id, error = %error, "Connection failed");
        self.emit(SessionEvent::connect_failed(&self.spec, error.to_string()));
        if stopping {
            debug!(endpoint = %self.id, "Stopped while connecting");
            self.emit(SessionEvent::disconnected(&self.spec, None));
        }
        self.state.send_replace(SessionState::Idle);
        self.filter
    }

    async fn shutdown(self, mut conn: Box<dyn Connection>) -> MessageFilter {
        self.state.send_replace(SessionState::Disconnecting);
        if let Err(e) = conn.close().await {
            debug!(endpoint = %self.id, error = %e, "Error while closing connection");
        }
        drop(conn);

        info!(endpoint = %self.id, "Disconnected");
        self.emit(SessionEvent::disconnected(&self.spec, None));
        self.state.send_replace(SessionState::Idle);
        self.filter
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!(endpoint = %self.id, "Event stream closed");
        }
    }
}
