//! # mqttbuzz-core
//!
//! Broker sessions, connection management and message filtering for MQTTBuzz.
//!
//! This crate provides the building blocks between the broker transport and
//! whatever renders notifications:
//!
//! - **Endpoint** - One configured broker + topic, with defaults and validation
//! - **Filter** - Per-endpoint dedup/throttle decisions
//! - **Session** - The connection state machine for one endpoint
//! - **Manager** - Start/stop/reconnect of the whole set of sessions
//! - **Event** - The single stream every session reports to
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Session   │────▶│   Events    │────▶ sink
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        ▲       │
//!                        │       ▼
//!               ┌─────────────┐ ┌─────────────┐
//!               │   Manager   │ │   Filter    │
//!               └─────────────┘ └─────────────┘
//! ```

pub mod endpoint;
pub mod event;
pub mod filter;
pub mod manager;
pub mod session;

pub use endpoint::{
    resolve_endpoints, ConfigError, EndpointId, EndpointRecord, EndpointSpec, ResolvedEndpoints,
};
pub use event::{EventSender, EventStream, SessionEvent};
pub use filter::{FilterMode, FilterPolicy, FilterState, MessageFilter};
pub use manager::{
    ConnectionManager, ManagerStats, ReconnectReport, StartReport, StopReport, ToggleOutcome,
};
pub use session::{BrokerSession, SessionSettings, SessionState, StopOutcome};
