//! # Dashboard Store
//!
//! Consumer-side view of the telemetry: per-source sensor histories and the alert
//! board. It is an owned value with no I/O and no timers of its own; callers pass the
//! current time where expiry matters, which keeps every rule testable with fixed
//! timestamps.
//!
//! ```text
//! TelemetryDispatcher ──► DashboardConsumer ──► Arc<Mutex<DashboardStore>>
//!                                                 ├── temperature: source -> SensorSeries
//!                                                 ├── humidity:    source -> SensorSeries
//!                                                 └── AlertBoard
//! ```

pub mod alerts;
pub mod consumer;
pub mod history;

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::mqtt::payload::{AlertColor, SensorReading};
use alerts::AlertBoard;
use history::{HistoryRing, Trend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorKind {
    Temperature,
    Humidity,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SensorKind::Temperature => f.write_str("temperature"),
            SensorKind::Humidity => f.write_str("humidity"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorSeries {
    pub history: HistoryRing,
    pub current: Option<f64>,
    pub count: u64,
    pub last_update: Option<DateTime<Local>>,
}

impl SensorSeries {
    fn new(history_len: usize) -> Self {
        Self {
            history: HistoryRing::new(history_len),
            current: None,
            count: 0,
            last_update: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DashboardSettings {
    pub history_len: usize,
    pub alert_ttl: Duration,
    pub alert_log_len: usize,
    pub alert_log_max_age: Duration,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            history_len: 15,
            alert_ttl: Duration::from_secs(30),
            alert_log_len: 50,
            alert_log_max_age: Duration::from_secs(300),
        }
    }
}

/// Counts shown in the periodic dashboard log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardSummary {
    pub sources: usize,
    pub readings: u64,
    pub active_alerts: usize,
    pub logged_alerts: usize,
}

impl fmt::Display for DashboardSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} sources, {} readings, {} active alerts, {} alerts logged",
            self.sources, self.readings, self.active_alerts, self.logged_alerts
        )
    }
}

#[derive(Debug, Clone)]
pub struct DashboardStore {
    settings: DashboardSettings,
    series: BTreeMap<(SensorKind, String), SensorSeries>,
    alerts: AlertBoard,
}

impl DashboardStore {
    pub fn new(settings: DashboardSettings) -> Self {
        Self {
            settings,
            series: BTreeMap::new(),
            alerts: AlertBoard::new(
                settings.alert_ttl,
                settings.alert_log_len,
                settings.alert_log_max_age,
            ),
        }
    }

    /// Adds a reading to its source's history and returns the trend.
    pub fn record_reading(&mut self, kind: SensorKind, reading: &SensorReading) -> Trend {
        let history_len = self.settings.history_len;
        let series = self
            .series
            .entry((kind, reading.source_id.clone()))
            .or_insert_with(|| SensorSeries::new(history_len));

        series.current = Some(reading.value);
        series.count += 1;
        series.last_update = Some(reading.timestamp);
        series.history.push(reading.value, reading.timestamp)
    }

    pub fn record_alert(&mut self, alert: &AlertColor) {
        self.alerts.record(alert);
    }

    pub fn series(&self, kind: SensorKind, source_id: &str) -> Option<&SensorSeries> {
        self.series.get(&(kind, source_id.to_string()))
    }

    pub fn sources(&self, kind: SensorKind) -> Vec<&str> {
        self.series
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, source)| source.as_str())
            .collect()
    }

    pub fn alerts(&self) -> &AlertBoard {
        &self.alerts
    }

    pub fn alerts_mut(&mut self) -> &mut AlertBoard {
        &mut self.alerts
    }

    pub fn summary(&self, now: DateTime<Local>) -> DashboardSummary {
        let sources: std::collections::BTreeSet<&str> =
            self.series.keys().map(|(_, source)| source.as_str()).collect();

        DashboardSummary {
            sources: sources.len(),
            readings: self.series.values().map(|series| series.count).sum(),
            active_alerts: self.alerts.active_sources(now).len(),
            logged_alerts: self.alerts.log().count(),
        }
    }
}

impl Default for DashboardStore {
    fn default() -> Self {
        Self::new(DashboardSettings::default())
    }
}
