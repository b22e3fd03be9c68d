//! Per-endpoint message filtering.
//!
//! A filter decides whether an incoming message is surfaced or suppressed,
//! based on a [`FilterPolicy`] and the [`FilterState`] remembered for that
//! endpoint. State is owned by the endpoint's session; nothing here is shared
//! between endpoints.

use crate::endpoint::EndpointId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// How repeated messages are suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Forward everything.
    #[default]
    None,
    /// Suppress identical content within the window.
    Dedup,
    /// Suppress any content within the window.
    Throttle,
}

impl FilterMode {
    /// Name used in configuration files.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Dedup => "dedup",
            Self::Throttle => "throttle",
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "dedup" => Ok(Self::Dedup),
            "throttle" => Ok(Self::Throttle),
            other => Err(other.to_string()),
        }
    }
}

/// A filter mode together with its time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterPolicy {
    /// Filter mode.
    pub mode: FilterMode,
    /// Suppression window. Ignored for [`FilterMode::None`].
    pub window: Duration,
}

impl FilterPolicy {
    /// Forward every message.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            mode: FilterMode::None,
            window: Duration::ZERO,
        }
    }

    /// Suppress identical content seen within `window`.
    #[must_use]
    pub const fn dedup(window: Duration) -> Self {
        Self {
            mode: FilterMode::Dedup,
            window,
        }
    }

    /// Suppress anything arriving within `window` of the last forward.
    #[must_use]
    pub const fn throttle(window: Duration) -> Self {
        Self {
            mode: FilterMode::Throttle,
            window,
        }
    }
}

/// What a filter remembers about one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    /// Content of the last forwarded message (dedup only).
    pub last_message: Option<String>,
    /// When the last message was forwarded.
    pub last_time: Option<Instant>,
}

impl FilterState {
    /// Check whether nothing has been forwarded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_message.is_none() && self.last_time.is_none()
    }

    /// True when no forward has happened yet, or the last one is more than
    /// `window` before `now`.
    fn window_elapsed(&self, now: Instant, window: Duration) -> bool {
        match self.last_time {
            None => true,
            Some(last) => now.saturating_duration_since(last) > window,
        }
    }
}

/// Decide whether `message` is forwarded, returning the decision and the
/// endpoint's next state.
#[must_use]
pub fn decide(
    endpoint: &EndpointId,
    message: &str,
    policy: &FilterPolicy,
    mut state: FilterState,
    now: Instant,
) -> (bool, FilterState) {
    let forward = match policy.mode {
        FilterMode::None => true,
        FilterMode::Dedup => {
            let changed = state.last_message.as_deref() != Some(message);
            let forward = changed || state.window_elapsed(now, policy.window);
            if forward {
                state.last_message = Some(message.to_string());
                state.last_time = Some(now);
            }
            forward
        }
        FilterMode::Throttle => {
            let forward = state.window_elapsed(now, policy.window);
            if forward {
                state.last_time = Some(now);
            }
            forward
        }
    };

    trace!(endpoint = %endpoint, mode = %policy.mode, forward, "Filter decision");
    (forward, state)
}

/// A policy bound to the state it mutates.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    policy: FilterPolicy,
    state: FilterState,
}

impl MessageFilter {
    /// Create a filter with empty state.
    #[must_use]
    pub fn new(policy: FilterPolicy) -> Self {
        Self {
            policy,
            state: FilterState::default(),
        }
    }

    /// Get the policy.
    #[must_use]
    pub fn policy(&self) -> &FilterPolicy {
        &self.policy
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> &FilterState {
        &self.state
    }

    /// Evaluate a message, updating state. Returns `true` if it is forwarded.
    pub fn admit(&mut self, endpoint: &EndpointId, message: &str, now: Instant) -> bool {
        let state = std::mem::take(&mut self.state);
        let (forward, next) = decide(endpoint, message, &self.policy, state, now);
        self.state = next;
        forward
    }
}
