//! # mqttbuzz-transport
//!
//! Broker transport abstraction layer for MQTTBuzz.
//!
//! This crate provides a unified interface for talking to a message broker:
//!
//! - **MQTT** - A real broker connection backed by `rumqttc`
//! - **Memory** - An in-process broker, for tests and local demos
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Transport` and `Connection` traits,
//! allowing sessions to be broker-agnostic.
//!
//! ```rust,ignore
//! use mqttbuzz_transport::{Connection, ConnectTarget, Transport};
//!
//! async fn listen(transport: &dyn Transport, target: &ConnectTarget) {
//!     let mut conn = transport.connect(target).await?;
//!     conn.subscribe("sensors/door").await?;
//!     while let Ok(Some(message)) = conn.recv().await {
//!         // Process message
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use memory::MemoryTransport;
pub use traits::{
    ConnectTarget, Connection, ConnectionId, Credentials, InboundMessage, Transport,
    TransportError,
};

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
