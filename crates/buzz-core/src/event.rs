//! Events emitted by broker sessions.
//!
//! Every session writes to the same ordered stream; the consumer decides how
//! to present them.

use crate::endpoint::{EndpointId, EndpointSpec};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Sending half of the event stream.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Receiving half of the event stream.
pub type EventStream = mpsc::UnboundedReceiver<SessionEvent>;

/// Create a new event stream.
#[must_use]
pub fn event_stream() -> (EventSender, EventStream) {
    mpsc::unbounded_channel()
}

/// A lifecycle transition or a forwarded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The transport connection could not be established.
    ConnectFailed {
        /// Endpoint identity.
        endpoint: EndpointId,
        /// Notification title.
        header: String,
        /// Notification subtitle.
        subheader: String,
        /// Transport error text.
        error: String,
    },

    /// Connected and subscribed.
    Connected {
        /// Endpoint identity.
        endpoint: EndpointId,
        /// Notification title.
        header: String,
        /// Notification subtitle.
        subheader: String,
    },

    /// The session is no longer connected.
    Disconnected {
        /// Endpoint identity.
        endpoint: EndpointId,
        /// Notification title.
        header: String,
        /// Notification subtitle.
        subheader: String,
        /// Why the connection dropped; `None` when it was asked to stop.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A message passed the endpoint's filter.
    MessageForwarded {
        /// Endpoint identity.
        endpoint: EndpointId,
        /// Notification title.
        header: String,
        /// Notification subtitle.
        subheader: String,
        /// Message text, truncated to the configured maximum.
        body: String,
        /// Whether the endpoint asks for a sound.
        sound_enabled: bool,
    },
}

impl SessionEvent {
    pub(crate) fn connect_failed(spec: &EndpointSpec, error: impl Into<String>) -> Self {
        Self::ConnectFailed {
            endpoint: spec.id(),
            header: spec.header.clone(),
            subheader: spec.subheader.clone(),
            error: error.into(),
        }
    }

    pub(crate) fn connected(spec: &EndpointSpec) -> Self {
        Self::Connected {
            endpoint: spec.id(),
            header: spec.header.clone(),
            subheader: spec.subheader.clone(),
        }
    }

    pub(crate) fn disconnected(spec: &EndpointSpec, reason: Option<String>) -> Self {
        Self::Disconnected {
            endpoint: spec.id(),
            header: spec.header.clone(),
            subheader: spec.subheader.clone(),
            reason,
        }
    }

    pub(crate) fn forwarded(spec: &EndpointSpec, body: String) -> Self {
        Self::MessageForwarded {
            endpoint: spec.id(),
            header: spec.header.clone(),
            subheader: spec.subheader.clone(),
            body,
            sound_enabled: spec.sound_enabled,
        }
    }

    /// Endpoint the event belongs to.
    #[must_use]
    pub fn endpoint(&self) -> &EndpointId {
        match self {
            Self::ConnectFailed { endpoint, .. }
            | Self::Connected { endpoint, .. }
            | Self::Disconnected { endpoint, .. }
            | Self::MessageForwarded { endpoint, .. } => endpoint,
        }
    }

    /// Notification title of the endpoint.
    #[must_use]
    pub fn header(&self) -> &str {
        match self {
            Self::ConnectFailed { header, .. }
            | Self::Connected { header, .. }
            | Self::Disconnected { header, .. }
            | Self::MessageForwarded { header, .. } => header,
        }
    }

    /// Check if this is a lifecycle event rather than a forwarded message.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::MessageForwarded { .. })
    }
}

/// Truncate `text` to at most `max_chars` characters.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
