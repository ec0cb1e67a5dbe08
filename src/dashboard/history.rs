use chrono::{DateTime, Local};
use std::collections::VecDeque;

/// Changes smaller than this are reported as stable.
pub const TREND_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn between(previous: f64, current: f64) -> Self {
        let diff = current - previous;
        if diff.abs() < TREND_THRESHOLD {
            Trend::Stable
        } else if diff > 0.0 {
            Trend::Up
        } else {
            Trend::Down
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Trend::Up => "↑",
            Trend::Down => "↓",
            Trend::Stable => "→",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub value: f64,
    pub timestamp: DateTime<Local>,
    pub trend: Trend,
}

/// Bounded history, newest entry first. Pushing onto a full ring evicts the oldest.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds a value and returns the trend relative to the previous newest entry.
    pub fn push(&mut self, value: f64, timestamp: DateTime<Local>) -> Trend {
        let trend = self
            .newest()
            .map_or(Trend::Stable, |previous| Trend::between(previous.value, value));

        self.entries.push_front(HistoryEntry {
            value,
            timestamp,
            trend,
        });
        self.entries.truncate(self.capacity);
        trend
    }

    pub fn newest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
