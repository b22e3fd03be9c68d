//! Application runtime.
//!
//! Wires the connection manager to the notifier and drives it from
//! line-based commands on stdin until interrupted.

use crate::config::Config;
use crate::metrics;
use crate::notify::{sink_from_env, Notifier};
use anyhow::{Context, Result};
use mqttbuzz_core::{
    ConfigError, ConnectionManager, EventStream, ReconnectReport, StartReport, StopReport,
    ToggleOutcome,
};
use mqttbuzz_transport::{MqttTransport, Transport};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A command read from stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stop everything if connected, otherwise connect.
    Toggle,
    /// Re-read the configuration file and reconnect.
    Reload,
    /// Flip the global sound switch.
    Sound,
    /// Log the state of every session.
    Status,
    /// List the commands.
    Help,
    /// Disconnect and exit.
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "toggle" | "t" => Ok(Self::Toggle),
            "reload" | "r" => Ok(Self::Reload),
            "sound" | "s" => Ok(Self::Sound),
            "status" => Ok(Self::Status),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(format!("unknown command '{other}' (try 'help')")),
        }
    }
}

/// The running application.
pub struct App {
    config: Config,
    config_path: Option<PathBuf>,
    manager: Arc<ConnectionManager>,
    notifier: Arc<Notifier>,
    pump: JoinHandle<()>,
}

impl App {
    /// Create the application. Nothing connects until [`App::connect`].
    #[must_use]
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        transport: Arc<dyn Transport>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let (manager, events) = ConnectionManager::new(transport, config.session_settings());
        let pump = tokio::spawn(pump_events(events, Arc::clone(&notifier)));

        Self {
            config,
            config_path,
            manager: Arc::new(manager),
            notifier,
            pump,
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start every enabled endpoint of the active configuration.
    pub async fn connect(&self) -> StartReport {
        self.notifier.announce("Attempting to connect to MQTT brokers");
        let resolved = self.config.endpoints();
        self.report_rejected(&resolved.rejected);

        let mut report = self.manager.start_all(resolved.specs).await;
        self.report_rejected(&report.rejected);

        let mut rejected = resolved.rejected;
        rejected.append(&mut report.rejected);
        report.rejected = rejected;
        metrics::set_live_sessions(self.manager.live_count());
        report
    }

    /// Run one command. Returns `false` when the application should exit.
    pub async fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::Toggle => {
                self.toggle().await;
            }
            Command::Reload => {
                if let Err(e) = self.reload().await {
                    error!(error = %e, "Reload failed");
                }
            }
            Command::Sound => {
                self.toggle_sounds();
            }
            Command::Status => self.status(),
            Command::Help => {
                info!("Commands: toggle, reload, sound, status, help, quit");
            }
            Command::Quit => return false,
        }
        true
    }

    /// Stop everything if anything is live, otherwise connect.
    pub async fn toggle(&self) -> ToggleOutcome {
        let live = self.manager.is_live();
        if !live {
            self.notifier.announce("Attempting to connect to MQTT brokers");
        }

        let outcome = self.manager.toggle().await;
        if let ToggleOutcome::Started(report) = &outcome {
            self.report_rejected(&report.rejected);
        }
        metrics::set_live_sessions(self.manager.live_count());
        outcome
    }

    /// Re-read the configuration file and replace the live set.
    ///
    /// An unreadable file leaves the active configuration untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no configuration file or it cannot be
    /// parsed.
    pub async fn reload(&mut self) -> Result<ReconnectReport> {
        let loaded = self
            .config_path
            .clone()
            .or_else(Config::locate)
            .context("No configuration file found")
            .and_then(|path| Config::from_file(&path).map(|config| (path, config)));

        let (path, config) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                self.notifier
                    .announce(format!("The configuration could not be loaded: {e:#}"));
                return Err(e);
            }
        };

        info!(path = %path.display(), "Configuration reloaded");
        self.notifier.announce("The configuration has been updated.");

        let resolved = config.endpoints();
        self.report_rejected(&resolved.rejected);
        let report = self
            .manager
            .reconfigure(config.session_settings(), resolved.specs)
            .await;
        self.report_rejected(&report.started.rejected);

        self.config = config;
        self.config_path = Some(path);
        metrics::set_live_sessions(self.manager.live_count());
        Ok(report)
    }

    /// Flip the global sound switch and announce the new state.
    pub fn toggle_sounds(&self) -> bool {
        let enabled = self.notifier.toggle_sounds();
        let state = if enabled { "enabled" } else { "disabled" };
        self.notifier.announce(format!("Sounds {state}."));
        enabled
    }

    /// Log the state of every session.
    pub fn status(&self) {
        let stats = self.manager.stats();
        info!(
            sessions = stats.sessions,
            connecting = stats.connecting,
            connected = stats.connected,
            idle = stats.idle,
            configured = self.config().mqtt_servers.len(),
            sounds = self.notifier.sounds_enabled(),
            "Status"
        );
        for (endpoint, state) in self.manager.session_states() {
            info!(endpoint = %endpoint, state = %state, "Session");
        }
    }

    /// Stop every session and wait for the remaining notifications.
    pub async fn shutdown(self) -> StopReport {
        let Self { manager, pump, .. } = self;
        let report = manager.stop_all().await;
        metrics::set_live_sessions(0);

        // The pump ends once the manager and its sessions are gone.
        drop(manager);
        if let Err(e) = pump.await {
            error!(error = %e, "Event pump failed");
        }
        report
    }

    fn report_rejected(&self, rejected: &[ConfigError]) {
        for error in rejected {
            warn!(error = %error, "Endpoint rejected");
            self.notifier
                .announce(format!("Invalid endpoint configuration: {error}"));
        }
    }
}

async fn pump_events(mut events: EventStream, notifier: Arc<Notifier>) {
    while let Some(event) = events.recv().await {
        debug!(endpoint = %event.endpoint(), "Event: {:?}", event);
        metrics::record_event(&event);
        notifier.event(&event);
    }
    debug!("Event stream closed");
}

/// Run the application until interrupted or told to quit.
///
/// # Errors
///
/// Returns an error if the application cannot start.
pub async fn run(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let transport: Arc<dyn Transport> = Arc::new(MqttTransport::default());
    let notifier = Arc::new(Notifier::new(sink_from_env(), config.sounds_enabled));
    info!(
        sink = notifier.sink_name(),
        endpoints = config.mqtt_servers.len(),
        "Starting MQTTBuzz"
    );

    let mut app = App::new(config, config_path, transport, notifier);
    app.connect().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for interrupt");
                }
                info!("Interrupted");
                break;
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match line.parse::<Command>() {
                        Ok(command) => {
                            if !app.execute(command).await {
                                break;
                            }
                        }
                        Err(e) => warn!("{}", e),
                    },
                    Ok(None) => {
                        debug!("stdin closed; waiting for interrupt");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read command");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    let report = app.shutdown().await;
    info!(stopped = report.total(), "MQTTBuzz stopped");
    Ok(())
}
