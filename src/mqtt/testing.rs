//! In-memory transport for exercising supervisors without a broker.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::config::BrokerEndpoint;
use super::topic::{MessageKind, Subscription, TopicPattern};
use super::transport::{Transport, TransportError, TransportEvent};

#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    Accept,
    Refuse(String),
    /// Never resolves; the supervisor's connect timeout has to fire
    Hang,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportLog {
    pub connects: usize,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub disconnects: usize,
}

type Inbound = Result<TransportEvent, TransportError>;

pub struct ScriptedTransport {
    script: VecDeque<ConnectBehavior>,
    fallback: ConnectBehavior,
    failing_filters: Vec<String>,
    connected: bool,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    log: Arc<Mutex<TransportLog>>,
}

/// Test-side remote control for a [`ScriptedTransport`].
#[derive(Clone)]
pub struct TransportController {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    log: Arc<Mutex<TransportLog>>,
}

impl ScriptedTransport {
    /// Connect attempts follow `script`; once it runs out every attempt is refused.
    pub fn new(script: Vec<ConnectBehavior>) -> (Self, TransportController) {
        Self::with_fallback(script, ConnectBehavior::Refuse("script exhausted".into()))
    }

    pub fn with_fallback(
        script: Vec<ConnectBehavior>,
        fallback: ConnectBehavior,
    ) -> (Self, TransportController) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(TransportLog::default()));

        let transport = Self {
            script: script.into(),
            fallback,
            failing_filters: Vec::new(),
            connected: false,
            inbound_rx,
            log: log.clone(),
        };
        (transport, TransportController { inbound_tx, log })
    }

    /// Makes every subscribe request for `filter` fail.
    pub fn failing_subscription(mut self, filter: &str) -> Self {
        self.failing_filters.push(filter.to_string());
        self
    }
}

impl TransportController {
    pub fn deliver(&self, topic: &str, payload: &str) {
        let _ = self.inbound_tx.send(Ok(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }));
    }

    pub fn fail(&self, error: TransportError) {
        let _ = self.inbound_tx.send(Err(error));
    }

    /// Broker answered a subscribe request with a failure SUBACK.
    pub fn reject_subscription(&self, packet_id: u16) {
        let _ = self
            .inbound_tx
            .send(Ok(TransportEvent::SubscriptionRejected { packet_id }));
    }

    pub fn close(&self, reason: &str) {
        let _ = self.inbound_tx.send(Ok(TransportEvent::Closed {
            reason: reason.to_string(),
        }));
    }

    pub fn log(&self) -> TransportLog {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self, _endpoint: &BrokerEndpoint) -> Result<(), TransportError> {
        self.connected = false;
        self.log.lock().unwrap().connects += 1;

        let behavior = self.script.pop_front().unwrap_or_else(|| self.fallback.clone());
        match behavior {
            ConnectBehavior::Accept => {
                self.connected = true;
                Ok(())
            }
            ConnectBehavior::Refuse(reason) => Err(TransportError::Connect(reason)),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.failing_filters.iter().any(|filter| filter == topic) {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        self.log.lock().unwrap().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.log
            .lock()
            .unwrap()
            .published
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let event = match self.inbound_rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        };
        if !matches!(event, Ok(TransportEvent::Message { .. }) | Ok(TransportEvent::SubscriptionRejected { .. })) {
            self.connected = false;
        }
        event
    }

    async fn disconnect(&mut self) {
        if std::mem::take(&mut self.connected) {
            self.log.lock().unwrap().disconnects += 1;
        }
    }
}

/// Endpoint subscribed to the temperature filter with a 10 s connect timeout.
pub fn endpoint(name: &str) -> BrokerEndpoint {
    BrokerEndpoint {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 1883,
        client_id: format!("test-{name}"),
        subscriptions: vec![Subscription::new(
            TopicPattern::parse("GTI700/Data/E2025/+/temperature").unwrap(),
            MessageKind::Temperature,
        )],
        keepalive: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(10),
    }
}
