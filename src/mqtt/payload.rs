//! Payload decoders
//!
//! Sensor payloads are ASCII decimal numbers (`"23.50"`), alert payloads are
//! `"R;G;B"` triples. Decoding never panics: malformed input always comes back as a
//! [`DecodeError`] so the caller can log it and move on to the next message.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use super::topic::MessageKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid payload format: {0}")]
    InvalidFormat(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),
}

/// An RGB color with every channel in [0, 255].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Validates three arbitrary integers; either all of them fit or the color is rejected.
    pub fn try_from_channels(r: i64, g: i64, b: i64) -> Result<Self, DecodeError> {
        let channel = |value: i64| {
            u8::try_from(value).map_err(|_| {
                DecodeError::OutOfRange(format!("channel {value} outside [0, 255]"))
            })
        };
        Ok(Self::new(channel(r)?, channel(g)?, channel(b)?))
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RGB({}, {}, {})", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Celsius,
    Percent,
}

impl Unit {
    pub fn for_kind(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::Temperature => Some(Unit::Celsius),
            MessageKind::Humidity => Some(Unit::Percent),
            MessageKind::Alert | MessageKind::Unknown => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::Percent => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub source_id: String,
    pub value: f64,
    pub unit: Unit,
    pub timestamp: DateTime<Local>,
    pub broker: String,
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "source {}: {}{} via {}",
            self.source_id,
            self.value,
            self.unit.symbol(),
            self.broker
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertColor {
    pub source_id: String,
    pub color: Rgb,
    pub timestamp: DateTime<Local>,
    pub broker: String,
}

impl fmt::Display for AlertColor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "source {}: {} via {}",
            self.source_id, self.color, self.broker
        )
    }
}

fn payload_text(payload: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(payload)
        .map(str::trim)
        .map_err(|_| DecodeError::InvalidFormat("payload is not valid UTF-8".to_string()))
}

/// Parses a sensor payload; the whole (trimmed) payload must be a finite number.
pub fn decode_sensor_value(payload: &[u8]) -> Result<f64, DecodeError> {
    let text = payload_text(payload)?;

    let value: f64 = text
        .parse()
        .map_err(|_| DecodeError::InvalidFormat(format!("'{text}' is not a number")))?;

    if !value.is_finite() {
        return Err(DecodeError::InvalidFormat(format!(
            "'{text}' is not a finite number"
        )));
    }

    Ok(value)
}

/// Parses the `"R;G;B"` channels of an alert payload.
pub fn decode_rgb(payload: &[u8]) -> Result<Rgb, DecodeError> {
    let text = payload_text(payload)?;

    let fields: Vec<&str> = text.split(';').collect();
    if fields.len() != 3 {
        return Err(DecodeError::InvalidFormat(format!(
            "expected 'R;G;B', got {} field(s) in '{text}'",
            fields.len()
        )));
    }

    let mut channels = [0i64; 3];
    for (slot, field) in channels.iter_mut().zip(&fields) {
        *slot = field.trim().parse().map_err(|_| {
            DecodeError::OutOfRange(format!("channel '{}' is not an integer", field.trim()))
        })?;
    }

    Rgb::try_from_channels(channels[0], channels[1], channels[2])
}

/// Decodes an alert from `source_id` received on `broker`. The whole alert is rejected
/// when any channel is invalid.
pub fn decode_alert_color(
    source_id: &str,
    broker: &str,
    payload: &[u8],
    timestamp: DateTime<Local>,
) -> Result<AlertColor, DecodeError> {
    Ok(AlertColor {
        source_id: source_id.to_string(),
        color: decode_rgb(payload)?,
        timestamp,
        broker: broker.to_string(),
    })
}

/// Formats a reading for publishing with a fixed number of fraction digits.
pub fn format_sensor_value(value: f64, decimals: usize) -> Option<String> {
    if !value.is_finite() {
        warn!("Refusing to format invalid sensor value: {}", value);
        return None;
    }
    Some(format!("{value:.decimals$}"))
}
