use chrono::{DateTime, Local, TimeDelta};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::mqtt::payload::{AlertColor, Rgb};

#[derive(Debug, Clone, PartialEq)]
pub struct AlertEntry {
    pub color: Rgb,
    pub received_at: DateTime<Local>,
    pub broker: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedAlert {
    pub source_id: String,
    pub color: Rgb,
    pub received_at: DateTime<Local>,
}

/// Latest alert per source plus a bounded, newest-first alert log.
///
/// An alert stays active for `ttl` after it was received. A newer alert from the same
/// source restarts that window; alerts from other sources do not affect it.
#[derive(Debug, Clone)]
pub struct AlertBoard {
    latest: BTreeMap<String, AlertEntry>,
    log: VecDeque<LoggedAlert>,
    ttl: TimeDelta,
    log_capacity: usize,
    log_max_age: TimeDelta,
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

impl AlertBoard {
    pub fn new(ttl: Duration, log_capacity: usize, log_max_age: Duration) -> Self {
        Self {
            latest: BTreeMap::new(),
            log: VecDeque::with_capacity(log_capacity),
            ttl: to_delta(ttl),
            log_capacity,
            log_max_age: to_delta(log_max_age),
        }
    }

    pub fn record(&mut self, alert: &AlertColor) {
        self.latest.insert(
            alert.source_id.clone(),
            AlertEntry {
                color: alert.color,
                received_at: alert.timestamp,
                broker: alert.broker.clone(),
                active: true,
            },
        );

        self.log.push_front(LoggedAlert {
            source_id: alert.source_id.clone(),
            color: alert.color,
            received_at: alert.timestamp,
        });
        self.log.truncate(self.log_capacity);
    }

    pub fn is_active(&self, source_id: &str, now: DateTime<Local>) -> bool {
        self.latest
            .get(source_id)
            .is_some_and(|entry| self.still_active(entry, now))
    }

    /// Sources with an active alert, in id order.
    pub fn active_sources(&self, now: DateTime<Local>) -> Vec<&str> {
        self.latest
            .iter()
            .filter(|(_, entry)| self.still_active(entry, now))
            .map(|(source, _)| source.as_str())
            .collect()
    }

    /// Marks expired alerts inactive and returns the sources that just expired.
    pub fn sweep(&mut self, now: DateTime<Local>) -> Vec<String> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        for (source, entry) in self.latest.iter_mut() {
            if entry.active && now - entry.received_at >= ttl {
                entry.active = false;
                expired.push(source.clone());
            }
        }
        expired
    }

    /// Latest alert of a source, active or not. The color stays known after expiry.
    pub fn latest(&self, source_id: &str) -> Option<&AlertEntry> {
        self.latest.get(source_id)
    }

    pub fn log(&self) -> impl Iterator<Item = &LoggedAlert> {
        self.log.iter()
    }

    /// Drops log entries older than the maximum age. Returns how many were removed.
    pub fn prune_log(&mut self, now: DateTime<Local>) -> usize {
        let before = self.log.len();
        let max_age = self.log_max_age;
        self.log.retain(|alert| now - alert.received_at < max_age);
        before - self.log.len()
    }

    fn still_active(&self, entry: &AlertEntry, now: DateTime<Local>) -> bool {
        entry.active && now - entry.received_at < self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn alert(source: &str, color: Rgb, at: DateTime<Local>) -> AlertColor {
        AlertColor {
            source_id: source.to_string(),
            color,
            timestamp: at,
            broker: "remote".to_string(),
        }
    }

    fn board() -> AlertBoard {
        AlertBoard::new(Duration::from_secs(30), 50, Duration::from_secs(300))
    }

    #[test]
    fn alert_expires_after_ttl() {
        let mut board = board();
        let t0 = Local::now();
        board.record(&alert("03", Rgb::new(255, 0, 0), t0));

        assert!(board.is_active("03", t0 + TimeDelta::seconds(29)));
        assert!(!board.is_active("03", t0 + TimeDelta::seconds(30)));

        assert_eq!(board.sweep(t0 + TimeDelta::seconds(31)), vec!["03".to_string()]);
        assert!(board.sweep(t0 + TimeDelta::seconds(40)).is_empty());
        assert_eq!(board.latest("03").map(|e| e.color), Some(Rgb::new(255, 0, 0)));
    }

    #[test]
    fn newer_alert_from_other_source_does_not_extend_expiry() {
        let mut board = board();
        let t0 = Local::now();
        board.record(&alert("03", Rgb::new(255, 0, 0), t0));
        board.record(&alert("07", Rgb::new(0, 0, 255), t0 + TimeDelta::seconds(20)));

        let later = t0 + TimeDelta::seconds(35);
        assert_eq!(board.active_sources(later), vec!["07"]);
    }

    #[test]
    fn repeated_alert_restarts_the_window() {
        let mut board = board();
        let t0 = Local::now();
        board.record(&alert("03", Rgb::new(255, 0, 0), t0));
        board.record(&alert("03", Rgb::new(0, 255, 0), t0 + TimeDelta::seconds(20)));

        assert!(board.is_active("03", t0 + TimeDelta::seconds(45)));
        assert!(board.sweep(t0 + TimeDelta::seconds(45)).is_empty());
    }

    #[test]
    fn log_is_bounded_and_pruned_by_age() {
        let mut board = AlertBoard::new(Duration::from_secs(30), 3, Duration::from_secs(300));
        let t0 = Local::now();
        for (i, source) in ["01", "02", "03", "04"].iter().enumerate() {
            board.record(&alert(source, Rgb::OFF, t0 + TimeDelta::seconds(i as i64 * 100)));
        }

        let sources: Vec<&str> = board.log().map(|a| a.source_id.as_str()).collect();
        assert_eq!(sources, vec!["04", "03", "02"]);

        let removed = board.prune_log(t0 + TimeDelta::seconds(450));
        assert_eq!(removed, 1);
        let sources: Vec<&str> = board.log().map(|a| a.source_id.as_str()).collect();
        assert_eq!(sources, vec!["04", "03"]);
    }
}
