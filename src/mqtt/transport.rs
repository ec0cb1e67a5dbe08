//! Broker transport
//!
//! The supervisor never talks to rumqttc directly. It drives a [`Transport`], which
//! hides the client/event-loop pair behind five operations. rumqttc reconnects on its
//! own whenever its event loop is polled after an error; [`RumqttTransport`] does not
//! let that happen. A failed or lost session is dropped entirely and the next
//! `connect` builds a fresh one, so every reconnection goes through the supervisor's
//! backoff.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::config::BrokerEndpoint;

const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Subscription to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The broker refused at least one filter of a subscribe request
    SubscriptionRejected { packet_id: u16 },
    /// Orderly close initiated by the broker
    Closed { reason: String },
}

#[async_trait]
pub trait Transport: Send + 'static {
    /// Opens a session and resolves once the broker acknowledged it.
    async fn connect(&mut self, endpoint: &BrokerEndpoint) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Waits for the next inbound event. An `Err` means the session is gone.
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError>;

    async fn disconnect(&mut self);
}

struct Session {
    client: AsyncClient,
    event_loop: EventLoop,
}

#[derive(Default)]
pub struct RumqttTransport {
    session: Option<Session>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(endpoint: &BrokerEndpoint) -> MqttOptions {
        let mut options =
            MqttOptions::new(endpoint.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options
            .set_keep_alive(endpoint.keepalive)
            .set_clean_session(true);
        options
    }

    fn session(&mut self) -> Result<&mut Session, TransportError> {
        self.session.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&mut self, endpoint: &BrokerEndpoint) -> Result<(), TransportError> {
        // A previous session is never resumed
        self.session = None;

        let (client, mut event_loop) = AsyncClient::new(Self::options(endpoint), REQUEST_CAPACITY);
        debug!("Dialing {}", endpoint);

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Connect(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    self.session = Some(Session { client, event_loop });
                    return Ok(());
                }
                Ok(event) => trace!("Ignoring pre-connack event: {:?}", event),
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let session = self.session()?;
        session
            .client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let session = self.session()?;
        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            let session = self.session()?;
            match session.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Ok(TransportEvent::SubscriptionRejected { packet_id: ack.pkid });
                    }
                    trace!("Subscription {} acknowledged", ack.pkid);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.session = None;
                    return Ok(TransportEvent::Closed {
                        reason: "broker sent DISCONNECT".to_string(),
                    });
                }
                Ok(event) => trace!("MQTT event: {:?}", event),
                Err(e) => {
                    self.session = None;
                    return Err(TransportError::ConnectionLost(e.to_string()));
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Err(e) = session.client.disconnect().await {
            warn!("Failed to queue DISCONNECT: {}", e);
            return;
        }

        // Poll until the DISCONNECT packet is on the wire
        let flush = async {
            loop {
                match session.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
            debug!("DISCONNECT not flushed within {:?}", DISCONNECT_FLUSH);
        }
    }
}
