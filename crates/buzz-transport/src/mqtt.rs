//! MQTT transport implementation.
//!
//! This module provides a broker transport using `rumqttc`. The client event
//! loop is driven inline by the owning session, so a connection makes exactly
//! one connect attempt and never reconnects on its own.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::traits::{
    ConnectTarget, Connection, ConnectionId, InboundMessage, Transport, TransportError,
};

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 10;

/// MQTT transport configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Quality of service requested for subscriptions.
    pub qos: QoS,
    /// Whether to ask the broker for a clean session.
    pub clean_session: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            clean_session: true,
        }
    }
}

/// MQTT transport.
#[derive(Debug, Clone, Default)]
pub struct MqttTransport {
    config: MqttConfig,
}

impl MqttTransport {
    /// Create a new MQTT transport.
    #[must_use]
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    fn options(&self, id: &ConnectionId, target: &ConnectTarget) -> MqttOptions {
        let mut options = MqttOptions::new(id.as_str(), target.host.as_str(), target.port);
        options.set_keep_alive(target.keep_alive);
        options.set_clean_session(self.config.clean_session);
        if let Some(creds) = &target.credentials {
            options.set_credentials(creds.username.as_str(), creds.password.as_str());
        }
        options
    }
}

/// Whole seconds for the client's connection timeout, rounded up, at least 1.
fn connection_timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

/// Map a refused subscription to an error.
fn check_suback(ack: &SubAck) -> Result<(), TransportError> {
    if ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        return Err(TransportError::Subscribe(
            "broker rejected subscription".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Connection>, TransportError> {
        let id = ConnectionId::generate();
        let options = self.options(&id, target);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        eventloop
            .network_options
            .set_connection_timeout(connection_timeout_secs(target.connect_timeout));

        debug!(connection = %id, broker = %target.authority(), "Connecting to MQTT broker");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        debug!(connection = %id, broker = %target.authority(), "Broker accepted connection");
                        break;
                    }
                    return Err(TransportError::ConnectFailed(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::ConnectFailed(e.to_string())),
            }
        }

        Ok(Box::new(MqttConnection {
            id,
            client,
            eventloop,
            qos: self.config.qos,
            is_open: true,
        }))
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

/// An MQTT broker connection.
pub struct MqttConnection {
    id: ConnectionId,
    client: AsyncClient,
    eventloop: EventLoop,
    qos: QoS,
    is_open: bool,
}

#[async_trait]
impl Connection for MqttConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.client
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    trace!(connection = %self.id, topic = %publish.topic, bytes = publish.payload.len(), "Publish received");
                    return Ok(Some(InboundMessage::new(publish.topic, publish.payload)));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if let Err(e) = check_suback(&ack) {
                        warn!(connection = %self.id, pkid = ack.pkid, "Broker rejected subscription");
                        self.is_open = false;
                        return Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    debug!(connection = %self.id, "Broker sent disconnect");
                    self.is_open = false;
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) => {
                    self.is_open = false;
                    return Err(TransportError::Disconnected(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(()); // Already closed
        }
        self.is_open = false;

        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))?;

        // Drive the event loop until the DISCONNECT packet is on the wire.
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    debug!(connection = %self.id, error = %e, "Connection ended while closing");
                    return Ok(());
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Credentials;

    #[test]
    fn test_mqtt_config_default() {
        let config = MqttConfig::default();
        assert_eq!(config.qos, QoS::AtMostOnce);
        assert!(config.clean_session);
    }

    #[test]
    fn test_options_from_target() {
        let transport = MqttTransport::default();
        let target = ConnectTarget::new("broker.local", 1884)
            .with_credentials(Credentials::new("alice", "secret"))
            .with_keep_alive(Duration::from_secs(30));
        let id = ConnectionId::new("client-1");

        let options = transport.options(&id, &target);
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "client-1");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn test_connection_timeout_rounds_up() {
        assert_eq!(connection_timeout_secs(Duration::from_secs(60)), 60);
        assert_eq!(connection_timeout_secs(Duration::from_millis(7_200)), 8);
        assert_eq!(connection_timeout_secs(Duration::from_millis(200)), 1);
        assert_eq!(connection_timeout_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_rejected_suback_is_an_error() {
        let granted = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        assert!(check_suback(&granted).is_ok());

        let refused = SubAck::new(2, vec![SubscribeReasonCode::Failure]);
        assert!(matches!(
            check_suback(&refused),
            Err(TransportError::Subscribe(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_configured_timeout() {
        // Accepts TCP connections but never answers CONNECT.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = MqttTransport::default();
        let target =
            ConnectTarget::new("127.0.0.1", port).with_connect_timeout(Duration::from_secs(7));

        let started = tokio::time::Instant::now();
        let result = transport.connect(&target).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
        assert!(elapsed >= Duration::from_secs(7), "gave up after {elapsed:?}");
        drop(listener);
    }

    #[tokio::test]
    async fn test_connect_unreachable_broker_fails() {
        let transport = MqttTransport::default();
        // Port 1 on loopback is never an MQTT broker.
        let target = ConnectTarget::new("127.0.0.1", 1);

        let result = transport.connect(&target).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
