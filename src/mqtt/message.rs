use chrono::{DateTime, Local};
use std::fmt;

use super::payload::{
    decode_alert_color, decode_sensor_value, AlertColor, DecodeError, SensorReading, Unit,
};
use super::topic::{Classification, MessageKind};

/// A publish received from a broker, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub broker: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(broker: impl Into<String>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            broker: broker.into(),
            topic: topic.into(),
            payload,
            received_at: Local::now(),
        }
    }

    pub fn classify(self, classification: Classification) -> ClassifiedMessage {
        ClassifiedMessage {
            kind: classification.kind,
            source_id: classification.source_id,
            raw_payload: self.payload,
            received_at: self.received_at,
            broker: self.broker,
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = String::from_utf8_lossy(&self.payload).chars().take(32).collect();
        write!(
            f,
            "{} [{}] {} = {}",
            self.received_at.format("%H:%M:%S"),
            self.broker,
            self.topic,
            preview
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedMessage {
    pub kind: MessageKind,
    pub source_id: String,
    pub raw_payload: Vec<u8>,
    pub received_at: DateTime<Local>,
    pub broker: String,
}

/// Typed result of decoding a classified message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Temperature(SensorReading),
    Humidity(SensorReading),
    Alert(AlertColor),
    /// Topic matched no route; nothing to decode
    Unrouted,
}

impl ClassifiedMessage {
    pub fn decode(self) -> Result<Decoded, DecodeError> {
        match self.kind {
            MessageKind::Temperature | MessageKind::Humidity => {
                let value = decode_sensor_value(&self.raw_payload)?;
                let reading = SensorReading {
                    unit: Unit::for_kind(self.kind).unwrap_or(Unit::Celsius),
                    source_id: self.source_id,
                    value,
                    timestamp: self.received_at,
                    broker: self.broker,
                };
                Ok(if self.kind == MessageKind::Temperature {
                    Decoded::Temperature(reading)
                } else {
                    Decoded::Humidity(reading)
                })
            }
            MessageKind::Alert => {
                let alert = decode_alert_color(
                    &self.source_id,
                    &self.broker,
                    &self.raw_payload,
                    self.received_at,
                )?;
                Ok(Decoded::Alert(alert))
            }
            MessageKind::Unknown => Ok(Decoded::Unrouted),
        }
    }
}
