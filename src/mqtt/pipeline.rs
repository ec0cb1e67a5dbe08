use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{Decoded, InboundMessage};
use super::supervisor::{LifecycleEvent, SupervisorEvent};
use super::topic::TopicRouter;
use crate::events::{Publish, TelemetryDispatcher, TelemetryEvent};

/// Per-broker counters, shared between the pipeline task and whoever reports stats.
#[derive(Debug, Default)]
pub struct MessageCounters {
    received: HashMap<String, AtomicU64>,
    dropped: AtomicU64,
}

impl MessageCounters {
    pub fn new<'a>(brokers: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            received: brokers
                .into_iter()
                .map(|name| (name.to_string(), AtomicU64::new(0)))
                .collect(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn received(&self, broker: &str) -> u64 {
        self.received
            .get(broker)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Messages that were classified as unknown or failed to decode.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record(&self, broker: &str) {
        if let Some(count) = self.received.get(broker) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Classifies, decodes and dispatches everything the supervisors produce.
pub struct MessagePipeline {
    routers: HashMap<String, TopicRouter>,
    counters: Arc<MessageCounters>,
    dispatcher: Arc<TelemetryDispatcher>,
}

impl MessagePipeline {
    pub fn new(
        routers: HashMap<String, TopicRouter>,
        counters: Arc<MessageCounters>,
        dispatcher: Arc<TelemetryDispatcher>,
    ) -> Self {
        Self {
            routers,
            counters,
            dispatcher,
        }
    }

    /// Consumes supervisor events until every sender is gone.
    pub fn spawn(self, mut event_rx: mpsc::Receiver<SupervisorEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                self.process(event);
            }
            debug!("Message pipeline finished");
        })
    }

    pub fn process(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Lifecycle { broker, event } => self.lifecycle(broker, event),
            SupervisorEvent::Message(message) => self.message(message),
        }
    }

    fn lifecycle(&self, broker: String, event: LifecycleEvent) {
        let event = match event {
            LifecycleEvent::Connected => TelemetryEvent::Connect { broker },
            LifecycleEvent::Disconnected { reason } => TelemetryEvent::Disconnect { broker, reason },
            LifecycleEvent::ReconnectScheduled { delay, attempt } => {
                TelemetryEvent::ReconnectScheduled {
                    broker,
                    delay,
                    attempt,
                }
            }
            LifecycleEvent::Exhausted { attempts } => {
                TelemetryEvent::ReconnectExhausted { broker, attempts }
            }
            LifecycleEvent::Error { error } => TelemetryEvent::Error {
                broker,
                message: error.to_string(),
            },
        };
        self.dispatcher.emit(&event);
    }

    fn message(&self, message: InboundMessage) {
        self.counters.record(&message.broker);

        let Some(router) = self.routers.get(&message.broker) else {
            warn!(broker = %message.broker, "No router for broker, dropping {}", message.topic);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let topic = message.topic.clone();
        let classified = message.classify(router.classify(&topic));
        let source = classified.source_id.clone();

        let event = match classified.decode() {
            Ok(Decoded::Temperature(reading)) => {
                info!(source = %source, "Temperature {:.2}{}", reading.value, reading.unit.symbol());
                TelemetryEvent::TemperatureReading(reading)
            }
            Ok(Decoded::Humidity(reading)) => {
                info!(source = %source, "Humidity {:.2}{}", reading.value, reading.unit.symbol());
                TelemetryEvent::HumidityReading(reading)
            }
            Ok(Decoded::Alert(alert)) => {
                info!(source = %source, "Alert {}", alert.color);
                TelemetryEvent::AlertReceived(alert)
            }
            Ok(Decoded::Unrouted) => {
                debug!("Unrouted topic {}", topic);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!(source = %source, "Dropping message on {}: {}", topic, e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.dispatcher.emit(&event);
    }
}
