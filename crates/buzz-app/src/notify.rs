//! Notification rendering and delivery.
//!
//! Session events are rendered into [`Notification`]s and handed to a
//! [`NotificationSink`]. The [`Notifier`] also owns the global sound switch.

use mqttbuzz_core::SessionEvent;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Title used for application-level notifications.
pub const APP_NAME: &str = "MQTTBuzz";

/// Environment variable selecting the sink.
pub const SINK_ENV: &str = "MQTTBUZZ_SINK";

/// A rendered, user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Title line.
    pub title: String,
    /// Subtitle line; may be empty.
    pub subtitle: String,
    /// Body text.
    pub message: String,
    /// Whether a sound should be played.
    pub sound: bool,
}

impl Notification {
    /// Create a notification with an empty subtitle.
    #[must_use]
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subtitle: String::new(),
            message: message.into(),
            sound: true,
        }
    }

    /// Set the subtitle.
    #[must_use]
    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = subtitle.into();
        self
    }

    /// Set whether a sound is requested.
    #[must_use]
    pub fn with_sound(mut self, sound: bool) -> Self {
        self.sound = sound;
        self
    }
}

/// Something that presents notifications to the user.
pub trait NotificationSink: Send + Sync {
    /// Present one notification.
    fn deliver(&self, notification: &Notification);

    /// Get the sink name.
    fn name(&self) -> &'static str;
}

/// Renders notifications through `tracing`.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, notification: &Notification) {
        info!(
            title = %notification.title,
            subtitle = %notification.subtitle,
            sound = notification.sound,
            "{}",
            notification.message
        );
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Writes each notification to stdout as one JSON object per line.
#[derive(Debug, Default)]
pub struct JsonLinesSink;

impl JsonLinesSink {
    fn write_line(notification: &Notification) -> std::io::Result<()> {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer(&mut stdout, notification)?;
        stdout.write_all(b"\n")?;
        stdout.flush()
    }
}

impl NotificationSink for JsonLinesSink {
    fn deliver(&self, notification: &Notification) {
        if let Err(e) = Self::write_line(notification) {
            warn!(error = %e, "Failed to write notification");
        }
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Pick the sink named by `MQTTBUZZ_SINK`.
#[must_use]
pub fn sink_from_env() -> Box<dyn NotificationSink> {
    match std::env::var(SINK_ENV).as_deref() {
        Ok("json") => Box::new(JsonLinesSink),
        _ => Box::new(LogSink),
    }
}

/// Render a session event the way it is shown to the user.
#[must_use]
pub fn render(event: &SessionEvent) -> Notification {
    match event {
        SessionEvent::ConnectFailed { header, error, .. } => {
            Notification::new(format!("MQTT Connection Failed ({header})"), error.as_str())
        }
        SessionEvent::Connected {
            header, subheader, ..
        } => Notification::new(
            APP_NAME,
            format!("Successfully connected to {header}:{subheader}"),
        ),
        SessionEvent::Disconnected {
            header,
            subheader,
            reason,
            ..
        } => {
            let message = match reason {
                Some(reason) => format!("Disconnected from {header}:{subheader} ({reason})"),
                None => format!("Disconnected from {header}:{subheader}"),
            };
            Notification::new(APP_NAME, message)
        }
        SessionEvent::MessageForwarded {
            header,
            subheader,
            body,
            sound_enabled,
            ..
        } => Notification::new(header.as_str(), body.as_str())
            .with_subtitle(subheader.as_str())
            .with_sound(*sound_enabled),
    }
}

/// Delivers notifications, applying the global sound switch.
pub struct Notifier {
    sink: Box<dyn NotificationSink>,
    sounds_enabled: AtomicBool,
}

impl Notifier {
    /// Create a notifier.
    #[must_use]
    pub fn new(sink: Box<dyn NotificationSink>, sounds_enabled: bool) -> Self {
        Self {
            sink,
            sounds_enabled: AtomicBool::new(sounds_enabled),
        }
    }

    /// Get the sink name.
    #[must_use]
    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Check the global sound switch.
    #[must_use]
    pub fn sounds_enabled(&self) -> bool {
        self.sounds_enabled.load(Ordering::Relaxed)
    }

    /// Flip the global sound switch, returning the new value.
    pub fn toggle_sounds(&self) -> bool {
        !self.sounds_enabled.fetch_xor(true, Ordering::Relaxed)
    }

    /// Deliver an application-level message.
    pub fn announce(&self, message: impl Into<String>) {
        self.deliver(Notification::new(APP_NAME, message));
    }

    /// Render and deliver a session event.
    pub fn event(&self, event: &SessionEvent) {
        self.deliver(render(event));
    }

    fn deliver(&self, mut notification: Notification) {
        notification.sound &= self.sounds_enabled();
        self.sink.deliver(&notification);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mqttbuzz_core::EndpointId;
    use std::sync::{Arc, Mutex};

    /// Collects notifications for assertions.
    #[derive(Clone, Default)]
    pub(crate) struct CollectingSink {
        pub(crate) delivered: Arc<Mutex<Vec<Notification>>>,
    }

    impl CollectingSink {
        pub(crate) fn take(&self) -> Vec<Notification> {
            std::mem::take(&mut *self.delivered.lock().unwrap())
        }
    }

    impl NotificationSink for CollectingSink {
        fn deliver(&self, notification: &Notification) {
            self.delivered.lock().unwrap().push(notification.clone());
        }

        fn name(&self) -> &'static str {
            "collect"
        }
    }

    fn endpoint() -> EndpointId {
        EndpointId::new("broker", 1883, "home/door")
    }

    #[test]
    fn test_render_lifecycle() {
        let connected = render(&SessionEvent::Connected {
            endpoint: endpoint(),
            header: "Home".into(),
            subheader: "Door".into(),
        });
        assert_eq!(connected.title, APP_NAME);
        assert_eq!(connected.message, "Successfully connected to Home:Door");

        let failed = render(&SessionEvent::ConnectFailed {
            endpoint: endpoint(),
            header: "Home".into(),
            subheader: "Door".into(),
            error: "connection refused".into(),
        });
        assert_eq!(failed.title, "MQTT Connection Failed (Home)");
        assert_eq!(failed.message, "connection refused");

        let stopped = render(&SessionEvent::Disconnected {
            endpoint: endpoint(),
            header: "Home".into(),
            subheader: "Door".into(),
            reason: None,
        });
        assert_eq!(stopped.message, "Disconnected from Home:Door");

        let dropped = render(&SessionEvent::Disconnected {
            endpoint: endpoint(),
            header: "Home".into(),
            subheader: "Door".into(),
            reason: Some("keep-alive timeout".into()),
        });
        assert_eq!(dropped.message, "Disconnected from Home:Door (keep-alive timeout)");
    }

    #[test]
    fn test_render_message() {
        let n = render(&SessionEvent::MessageForwarded {
            endpoint: endpoint(),
            header: "Home".into(),
            subheader: "Door".into(),
            body: "opened".into(),
            sound_enabled: false,
        });
        assert_eq!(n.title, "Home");
        assert_eq!(n.subtitle, "Door");
        assert_eq!(n.message, "opened");
        assert!(!n.sound);
    }

    #[test]
    fn test_global_sound_switch() {
        let sink = CollectingSink::default();
        let notifier = Notifier::new(Box::new(sink.clone()), true);
        let event = SessionEvent::MessageForwarded {
            endpoint: endpoint(),
            header: "Home".into(),
            subheader: "Door".into(),
            body: "opened".into(),
            sound_enabled: true,
        };

        notifier.event(&event);
        assert!(!notifier.toggle_sounds());
        notifier.event(&event);
        assert!(notifier.toggle_sounds());
        notifier.announce("Sounds enabled.");

        let delivered = sink.take();
        assert!(delivered[0].sound);
        assert!(!delivered[1].sound);
        assert!(delivered[2].sound);
        assert_eq!(delivered[2].title, APP_NAME);
    }

    #[test]
    fn test_notification_json() {
        let n = Notification::new("Home", "opened").with_subtitle("Door");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["title"], "Home");
        assert_eq!(json["subtitle"], "Door");
        assert_eq!(json["sound"], true);
    }
}
