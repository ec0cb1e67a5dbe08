//! # Telemetry Events
//!
//! Everything the broker side learns is turned into a [`TelemetryEvent`] and handed to
//! the [`TelemetryDispatcher`]. Consumers (dashboard store, alert subscriber, loggers)
//! register handlers per [`EventKind`] and never see MQTT details.
//!
//! ```text
//! supervisors ──► pipeline ──► TelemetryDispatcher ──┬──► dashboard handlers
//!                (classify,        (per kind,         ├──► LED worker
//!                 decode)           in order)         └──► ...
//! ```

pub mod bus;

pub use bus::{EmitReport, Event, EventBus, Handler, HandlerError, Publish, Subscribe, SubscriptionId};

use std::time::Duration;

use crate::mqtt::payload::{AlertColor, SensorReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Error,
    ReconnectScheduled,
    ReconnectExhausted,
    TemperatureReading,
    HumidityReading,
    AlertReceived,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Connect { broker: String },
    Disconnect { broker: String, reason: String },
    Error { broker: String, message: String },
    ReconnectScheduled { broker: String, delay: Duration, attempt: u32 },
    ReconnectExhausted { broker: String, attempts: u32 },
    TemperatureReading(SensorReading),
    HumidityReading(SensorReading),
    AlertReceived(AlertColor),
}

impl Event for TelemetryEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            TelemetryEvent::Connect { .. } => EventKind::Connect,
            TelemetryEvent::Disconnect { .. } => EventKind::Disconnect,
            TelemetryEvent::Error { .. } => EventKind::Error,
            TelemetryEvent::ReconnectScheduled { .. } => EventKind::ReconnectScheduled,
            TelemetryEvent::ReconnectExhausted { .. } => EventKind::ReconnectExhausted,
            TelemetryEvent::TemperatureReading(_) => EventKind::TemperatureReading,
            TelemetryEvent::HumidityReading(_) => EventKind::HumidityReading,
            TelemetryEvent::AlertReceived(_) => EventKind::AlertReceived,
        }
    }
}

pub type TelemetryDispatcher = EventBus<TelemetryEvent>;
