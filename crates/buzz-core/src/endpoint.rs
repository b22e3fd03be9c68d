//! Endpoint specifications.
//!
//! An endpoint is one broker + topic pair. Configuration supplies loosely
//! typed [`EndpointRecord`]s; [`EndpointSpec::from_record`] validates them and
//! fills in defaults.

use crate::filter::{FilterMode, FilterPolicy};
use mqttbuzz_transport::{ConnectTarget, Credentials};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default maximum length of a forwarded message body, in characters.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 256;

/// Reasons an endpoint record is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Broker address is missing or blank.
    #[error("endpoint #{index}: broker address is empty")]
    EmptyAddress {
        /// Position of the record in the configuration.
        index: usize,
    },

    /// Topic is missing or blank.
    #[error("endpoint #{index} ({address}): topic is empty")]
    EmptyTopic {
        /// Position of the record in the configuration.
        index: usize,
        /// Broker address of the record.
        address: String,
    },

    /// Port zero cannot be connected to.
    #[error("endpoint #{index} ({address}): port must be non-zero")]
    InvalidPort {
        /// Position of the record in the configuration.
        index: usize,
        /// Broker address of the record.
        address: String,
    },

    /// Unrecognised filter name.
    #[error("endpoint {endpoint}: unknown filter '{filter}' (expected none, dedup or throttle)")]
    UnknownFilter {
        /// Endpoint the record describes.
        endpoint: EndpointId,
        /// The filter value found.
        filter: String,
    },

    /// Negative or non-finite filter window.
    #[error("endpoint {endpoint}: invalid filter_time {value}")]
    InvalidFilterTime {
        /// Endpoint the record describes.
        endpoint: EndpointId,
        /// The window value found, in seconds.
        value: f64,
    },

    /// A password was given without a username.
    #[error("endpoint {endpoint}: password given without username")]
    PasswordWithoutUsername {
        /// Endpoint the record describes.
        endpoint: EndpointId,
    },

    /// The same broker + topic appears more than once.
    #[error("endpoint {endpoint}: duplicate broker and topic")]
    Duplicate {
        /// Endpoint that was already configured.
        endpoint: EndpointId,
    },
}

/// Identity of an endpoint: broker address, port and topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Build the identity of a broker + topic pair.
    #[must_use]
    pub fn new(address: &str, port: u16, topic: &str) -> Self {
        Self(format!("{address}:{port}/{topic}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One endpoint as it appears in configuration.
///
/// Field names follow the configuration file format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Broker host name or address.
    #[serde(default)]
    pub mqtt_broker: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub mqtt_port: u16,

    /// Topic to subscribe to.
    #[serde(default)]
    pub mqtt_topic: String,

    /// Broker username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Broker password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Notification title. Defaults to the broker address.
    #[serde(default)]
    pub header: Option<String>,

    /// Notification subtitle. Defaults to the topic.
    #[serde(default)]
    pub subheader: Option<String>,

    /// Whether to connect to this endpoint at all.
    #[serde(default)]
    pub broker_enabled: bool,

    /// Whether notifications from this endpoint play a sound.
    #[serde(default)]
    pub sounds_enabled: Option<bool>,

    /// Filter name: `none`, `dedup` or `throttle`.
    #[serde(default)]
    pub filter: Option<String>,

    /// Filter window in seconds.
    #[serde(default)]
    pub filter_time: f64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// A validated endpoint, immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSpec {
    /// Broker host name or address.
    pub address: String,
    /// Broker port.
    pub port: u16,
    /// Topic to subscribe to.
    pub topic: String,
    /// Optional broker credentials.
    pub credentials: Option<Credentials>,
    /// Notification title.
    pub header: String,
    /// Notification subtitle.
    pub subheader: String,
    /// Whether a session is created for this endpoint.
    pub enabled: bool,
    /// Whether forwarded messages request a sound.
    pub sound_enabled: bool,
    /// Filter applied to incoming messages.
    pub filter: FilterPolicy,
}

impl EndpointSpec {
    /// Create an enabled endpoint with default presentation and no filter.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16, topic: impl Into<String>) -> Self {
        let address = address.into();
        let topic = topic.into();
        Self {
            header: address.clone(),
            subheader: topic.clone(),
            address,
            port,
            topic,
            credentials: None,
            enabled: true,
            sound_enabled: true,
            filter: FilterPolicy::none(),
        }
    }

    /// Set the filter policy.
    #[must_use]
    pub fn with_filter(mut self, filter: FilterPolicy) -> Self {
        self.filter = filter;
        self
    }

    /// Set the notification header.
    #[must_use]
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }

    /// Set the notification subheader.
    #[must_use]
    pub fn with_subheader(mut self, subheader: impl Into<String>) -> Self {
        self.subheader = subheader.into();
        self
    }

    /// Set broker credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Enable or disable the endpoint.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Enable or disable sound for this endpoint.
    #[must_use]
    pub fn with_sound(mut self, sound_enabled: bool) -> Self {
        self.sound_enabled = sound_enabled;
        self
    }

    /// Identity of this endpoint.
    #[must_use]
    pub fn id(&self) -> EndpointId {
        EndpointId::new(&self.address, self.port, &self.topic)
    }

    /// Connection target for the transport.
    #[must_use]
    pub fn connect_target(&self, keep_alive: Duration, connect_timeout: Duration) -> ConnectTarget {
        let target = ConnectTarget::new(self.address.clone(), self.port)
            .with_keep_alive(keep_alive)
            .with_connect_timeout(connect_timeout);
        match &self.credentials {
            Some(creds) => target.with_credentials(creds.clone()),
            None => target,
        }
    }

    /// Validate a configuration record and fill in defaults.
    ///
    /// `index` is the record's position, used in error messages.
    /// `default_sound` applies when the record has no `sounds_enabled`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the record is malformed.
    pub fn from_record(
        index: usize,
        record: &EndpointRecord,
        default_sound: bool,
    ) -> Result<Self, ConfigError> {
        let address = record.mqtt_broker.trim();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress { index });
        }
        let topic = record.mqtt_topic.trim();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic {
                index,
                address: address.to_string(),
            });
        }
        if record.mqtt_port == 0 {
            return Err(ConfigError::InvalidPort {
                index,
                address: address.to_string(),
            });
        }

        let endpoint = EndpointId::new(address, record.mqtt_port, topic);

        let mode = match record.filter.as_deref() {
            None => FilterMode::None,
            Some(name) => name
                .parse::<FilterMode>()
                .map_err(|filter| ConfigError::UnknownFilter {
                    endpoint: endpoint.clone(),
                    filter,
                })?,
        };
        let window = Duration::try_from_secs_f64(record.filter_time).map_err(|_| {
            ConfigError::InvalidFilterTime {
                endpoint: endpoint.clone(),
                value: record.filter_time,
            }
        })?;

        let credentials = match (&record.username, &record.password) {
            (Some(user), password) => Some(Credentials::new(
                user.clone(),
                password.clone().unwrap_or_default(),
            )),
            (None, Some(_)) => return Err(ConfigError::PasswordWithoutUsername { endpoint }),
            (None, None) => None,
        };

        Ok(Self {
            address: address.to_string(),
            port: record.mqtt_port,
            topic: topic.to_string(),
            credentials,
            header: record
                .header
                .clone()
                .unwrap_or_else(|| address.to_string()),
            subheader: record
                .subheader
                .clone()
                .unwrap_or_else(|| topic.to_string()),
            enabled: record.broker_enabled,
            sound_enabled: record.sounds_enabled.unwrap_or(default_sound),
            filter: FilterPolicy { mode, window },
        })
    }
}

/// Result of resolving a whole endpoint list.
#[derive(Debug, Default)]
pub struct ResolvedEndpoints {
    /// Valid endpoints, in configuration order.
    pub specs: Vec<EndpointSpec>,
    /// Rejected records. Each one is skipped; the rest are unaffected.
    pub rejected: Vec<ConfigError>,
}

/// Validate every record, keeping the valid ones in order.
///
/// A record whose broker + topic repeats an earlier valid record is rejected
/// as a duplicate.
#[must_use]
pub fn resolve_endpoints(records: &[EndpointRecord], default_sound: bool) -> ResolvedEndpoints {
    let mut resolved = ResolvedEndpoints::default();
    let mut seen = HashSet::new();

    for (index, record) in records.iter().enumerate() {
        match EndpointSpec::from_record(index, record, default_sound) {
            Ok(spec) => {
                let id = spec.id();
                if seen.insert(id.clone()) {
                    resolved.specs.push(spec);
                } else {
                    warn!(endpoint = %id, "Rejected duplicate endpoint");
                    resolved.rejected.push(ConfigError::Duplicate { endpoint: id });
                }
            }
            Err(e) => {
                warn!(error = %e, "Rejected endpoint configuration");
                resolved.rejected.push(e);
            }
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(broker: &str, topic: &str) -> EndpointRecord {
        EndpointRecord {
            mqtt_broker: broker.to_string(),
            mqtt_port: DEFAULT_PORT,
            mqtt_topic: topic.to_string(),
            broker_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_id_format() {
        let id = EndpointId::new("broker.local", 1883, "home/door");
        assert_eq!(id.as_str(), "broker.local:1883/home/door");
        assert_eq!(id.to_string(), "broker.local:1883/home/door");
    }

    #[test]
    fn test_record_defaults() {
        let spec = EndpointSpec::from_record(0, &record("broker.local", "home/door"), true).unwrap();

        assert_eq!(spec.header, "broker.local");
        assert_eq!(spec.subheader, "home/door");
        assert_eq!(spec.filter, FilterPolicy::none());
        assert!(spec.sound_enabled);
        assert!(spec.credentials.is_none());
        assert!(spec.enabled);
    }

    #[test]
    fn test_record_sound_falls_back_to_global_default() {
        let spec = EndpointSpec::from_record(0, &record("b", "t"), false).unwrap();
        assert!(!spec.sound_enabled);

        let explicit = EndpointRecord {
            sounds_enabled: Some(true),
            ..record("b", "t")
        };
        assert!(EndpointSpec::from_record(0, &explicit, false).unwrap().sound_enabled);
    }

    #[test]
    fn test_record_from_json_uses_defaults() {
        let json = r#"{"mqtt_broker": "broker1", "mqtt_topic": "topic1"}"#;
        let record: EndpointRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.mqtt_port, DEFAULT_PORT);
        assert!(!record.broker_enabled);

        let spec = EndpointSpec::from_record(0, &record, true).unwrap();
        assert!(!spec.enabled);
        assert_eq!(spec.header, "broker1");
    }

    #[test]
    fn test_record_full() {
        let rec = EndpointRecord {
            username: Some("alice".into()),
            password: Some("secret".into()),
            header: Some("Front door".into()),
            subheader: Some("Motion".into()),
            filter: Some("dedup".into()),
            filter_time: 2.5,
            ..record("broker", "door")
        };
        let spec = EndpointSpec::from_record(0, &rec, true).unwrap();

        assert_eq!(spec.header, "Front door");
        assert_eq!(spec.subheader, "Motion");
        assert_eq!(spec.filter, FilterPolicy::dedup(Duration::from_millis(2500)));
        assert_eq!(spec.credentials, Some(Credentials::new("alice", "secret")));
    }

    #[test]
    fn test_record_errors() {
        assert_eq!(
            EndpointSpec::from_record(3, &record("  ", "t"), true),
            Err(ConfigError::EmptyAddress { index: 3 })
        );
        assert!(matches!(
            EndpointSpec::from_record(0, &record("b", ""), true),
            Err(ConfigError::EmptyTopic { .. })
        ));
        assert!(matches!(
            EndpointSpec::from_record(0, &EndpointRecord { mqtt_port: 0, ..record("b", "t") }, true),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            EndpointSpec::from_record(
                0,
                &EndpointRecord { filter: Some("sometimes".into()), ..record("b", "t") },
                true
            ),
            Err(ConfigError::UnknownFilter { filter, .. }) if filter == "sometimes"
        ));
        assert!(matches!(
            EndpointSpec::from_record(0, &EndpointRecord { filter_time: -1.0, ..record("b", "t") }, true),
            Err(ConfigError::InvalidFilterTime { .. })
        ));
        assert!(matches!(
            EndpointSpec::from_record(
                0,
                &EndpointRecord { password: Some("p".into()), ..record("b", "t") },
                true
            ),
            Err(ConfigError::PasswordWithoutUsername { .. })
        ));
    }

    #[test]
    fn test_resolve_skips_bad_entries() {
        let records = vec![
            record("a", "t"),
            record("", "t"),
            record("b", "t"),
            record("a", "t"),
        ];
        let resolved = resolve_endpoints(&records, true);

        let ids: Vec<_> = resolved.specs.iter().map(|s| s.address.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(resolved.rejected.len(), 2);
        assert!(matches!(resolved.rejected[1], ConfigError::Duplicate { .. }));
    }

    #[test]
    fn test_connect_target() {
        let spec = EndpointSpec::new("broker", 8883, "t")
            .with_credentials(Credentials::new("u", "p"));
        let target = spec.connect_target(Duration::from_secs(60), Duration::from_secs(15));

        assert_eq!(target.authority(), "broker:8883");
        assert_eq!(target.keep_alive, Duration::from_secs(60));
        assert_eq!(target.connect_timeout, Duration::from_secs(15));
        assert!(target.credentials.is_some());
    }
}
