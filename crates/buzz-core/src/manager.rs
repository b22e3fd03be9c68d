//! Connection manager.
//!
//! The manager owns one [`BrokerSession`] per enabled endpoint and keeps the
//! set of live sessions equal to the enabled endpoints of the current
//! configuration. Replacing the configuration tears the whole set down before
//! building the new one, so the same broker + topic is never subscribed twice.

use crate::endpoint::{ConfigError, EndpointId, EndpointSpec};
use crate::event::{event_stream, EventSender, EventStream};
use crate::session::{BrokerSession, SessionSettings, SessionState, StopOutcome};
use dashmap::DashMap;
use futures_util::future::join_all;
use mqttbuzz_transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Per-endpoint outcome of starting a configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartReport {
    /// Endpoints whose session was created and started.
    pub started: Vec<EndpointId>,
    /// Endpoints skipped because they are disabled.
    pub disabled: Vec<EndpointId>,
    /// Specs that could not be started.
    pub rejected: Vec<ConfigError>,
}

/// Per-endpoint outcome of stopping every session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Sessions that closed their connection.
    pub disconnected: Vec<EndpointId>,
    /// Sessions that were already idle (failed connect, dropped connection).
    pub already_idle: Vec<EndpointId>,
    /// Sessions torn down after the stop timeout.
    pub force_released: Vec<EndpointId>,
}

impl StopReport {
    /// Total number of sessions that were stopped.
    #[must_use]
    pub fn total(&self) -> usize {
        self.disconnected.len() + self.already_idle.len() + self.force_released.len()
    }
}

/// Outcome of [`ConnectionManager::reconnect_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectReport {
    /// The old set being torn down.
    pub stopped: StopReport,
    /// The new set being started.
    pub started: StartReport,
}

/// Outcome of [`ConnectionManager::toggle`].
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleOutcome {
    /// Sessions were live and have been stopped.
    Stopped(StopReport),
    /// Nothing was live; the current configuration was started.
    Started(StartReport),
}

/// Manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Number of live sessions.
    pub sessions: usize,
    /// Sessions currently connecting.
    pub connecting: usize,
    /// Sessions currently connected.
    pub connected: usize,
    /// Sessions idle after a failed connect or a dropped connection.
    pub idle: usize,
}

/// Sessions and the configuration they came from.
struct Lifecycle {
    specs: Vec<EndpointSpec>,
    settings: SessionSettings,
    sessions: HashMap<EndpointId, BrokerSession>,
}

/// Owns the set of broker sessions.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    events: EventSender,
    /// Serializes every change to the live set.
    lifecycle: Mutex<Lifecycle>,
    /// State watchers of the live set, readable without the lifecycle lock.
    live: DashMap<EndpointId, watch::Receiver<SessionState>>,
}

impl ConnectionManager {
    /// Create a manager with no sessions.
    ///
    /// Returns the manager and the stream every session reports to.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> (Self, EventStream) {
        let (events, stream) = event_stream();
        info!(transport = transport.name(), "Creating connection manager with settings: {:?}", settings);
        let manager = Self {
            transport,
            events,
            lifecycle: Mutex::new(Lifecycle {
                specs: Vec::new(),
                settings,
                sessions: HashMap::new(),
            }),
            live: DashMap::new(),
        };
        (manager, stream)
    }

    /// Settings the next started sessions use.
    pub async fn settings(&self) -> SessionSettings {
        self.lifecycle.lock().await.settings.clone()
    }

    /// Make `specs` the current configuration and start every enabled one.
    ///
    /// Any sessions that are already live are stopped first.
    pub async fn start_all(&self, specs: Vec<EndpointSpec>) -> StartReport {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.sessions.is_empty() {
            let stopped = self.stop_locked(&mut lifecycle).await;
            debug!(stopped = stopped.total(), "Stopped previous sessions before starting");
        }
        self.start_locked(&mut lifecycle, specs).await
    }

    /// Stop every live session.
    ///
    /// Returns once each session has reported `Disconnected` or been
    /// force-released.
    pub async fn stop_all(&self) -> StopReport {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await
    }

    /// Replace the configuration: stop the whole live set, then start
    /// `specs`, as one operation.
    pub async fn reconnect_all(&self, specs: Vec<EndpointSpec>) -> ReconnectReport {
        let mut lifecycle = self.lifecycle.lock().await;
        let stopped = self.stop_locked(&mut lifecycle).await;
        let started = self.start_locked(&mut lifecycle, specs).await;
        info!(
            stopped = stopped.total(),
            started = started.started.len(),
            "Reconnected all endpoints"
        );
        ReconnectReport { stopped, started }
    }

    /// Like [`reconnect_all`](Self::reconnect_all), but the new set runs
    /// with `settings`. The old set is stopped with its own stop timeout.
    pub async fn reconfigure(
        &self,
        settings: SessionSettings,
        specs: Vec<EndpointSpec>,
    ) -> ReconnectReport {
        let mut lifecycle = self.lifecycle.lock().await;
        let stopped = self.stop_locked(&mut lifecycle).await;
        debug!("Applying session settings: {:?}", settings);
        lifecycle.settings = settings;
        let started = self.start_locked(&mut lifecycle, specs).await;
        info!(
            stopped = stopped.total(),
            started = started.started.len(),
            "Reconfigured all endpoints"
        );
        ReconnectReport { stopped, started }
    }

    /// Stop everything if anything is live, otherwise start the current
    /// configuration.
    pub async fn toggle(&self) -> ToggleOutcome {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.sessions.is_empty() {
            let specs = lifecycle.specs.clone();
            ToggleOutcome::Started(self.start_locked(&mut lifecycle, specs).await)
        } else {
            ToggleOutcome::Stopped(self.stop_locked(&mut lifecycle).await)
        }
    }

    /// Check if any session is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.live.is_empty()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Current state of every live session, ordered by endpoint.
    #[must_use]
    pub fn session_states(&self) -> Vec<(EndpointId, SessionState)> {
        let mut states: Vec<_> = self
            .live
            .iter()
            .map(|e| (e.key().clone(), *e.value().borrow()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Get manager statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for entry in self.live.iter() {
            stats.sessions += 1;
            match *entry.value().borrow() {
                SessionState::Connecting => stats.connecting += 1,
                SessionState::Connected => stats.connected += 1,
                SessionState::Idle => stats.idle += 1,
                SessionState::Disconnecting => {}
            }
        }
        stats
    }

    async fn start_locked(&self, lifecycle: &mut Lifecycle, specs: Vec<EndpointSpec>) -> StartReport {
        let mut report = StartReport::default();

        for spec in &specs {
            let id = spec.id();
            if !spec.enabled {
                debug!(endpoint = %id, "Endpoint disabled, skipping");
                report.disabled.push(id);
                continue;
            }
            if lifecycle.sessions.contains_key(&id) {
                warn!(endpoint = %id, "Duplicate endpoint, skipping");
                report.rejected.push(ConfigError::Duplicate { endpoint: id });
                continue;
            }

            let mut session = BrokerSession::new(
                spec.clone(),
                Arc::clone(&self.transport),
                self.events.clone(),
                lifecycle.settings.clone(),
            );
            session.start().await;
            self.live.insert(id.clone(), session.watch_state());
            lifecycle.sessions.insert(id.clone(), session);
            report.started.push(id);
        }

        lifecycle.specs = specs;
        info!(
            started = report.started.len(),
            disabled = report.disabled.len(),
            rejected = report.rejected.len(),
            "Started endpoints"
        );
        report
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) -> StopReport {
        let timeout = lifecycle.settings.stop_timeout;
        let stops = lifecycle.sessions.drain().map(|(id, mut session)| async move {
            let outcome = session.stop(timeout).await;
            (id, outcome)
        });
        let outcomes = join_all(stops).await;

        let mut report = StopReport::default();
        for (id, outcome) in outcomes {
            self.live.remove(&id);
            match outcome {
                StopOutcome::Disconnected => report.disconnected.push(id),
                StopOutcome::AlreadyIdle => report.already_idle.push(id),
                StopOutcome::ForceReleased => report.force_released.push(id),
            }
        }

        if !report.force_released.is_empty() {
            warn!(
                count = report.force_released.len(),
                "Some sessions were force-released after the stop timeout"
            );
        }
        info!(stopped = report.total(), "Stopped all endpoints");
        report
    }
}
