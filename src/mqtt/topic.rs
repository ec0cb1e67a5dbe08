//! Topic patterns and message classification
//!
//! Subscriptions are declared as MQTT topic filters (`GTI700/Data/E2025/+/temperature`).
//! Instead of matching inbound topics with ad hoc string searches, each filter is
//! parsed once into a list of segment matchers and the [`TopicRouter`] walks them in
//! declaration order. The first route whose pattern matches decides the
//! [`MessageKind`]; anything else is [`MessageKind::Unknown`].
//!
//! ```text
//! GTI700 / Data / E2025 / 05 / temperature
//!   │       │      │      │       │
//! Literal Literal Literal  +    Literal      ──► Temperature, source "05"
//!                  ▲       │
//!              id marker ──┘ (leading digits of the next segment)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Source id reported when a topic carries no numeric id after the marker.
pub const UNKNOWN_SOURCE: &str = "XX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Temperature,
    Humidity,
    Alert,
    Unknown,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MessageKind::Temperature => "temperature",
            MessageKind::Humidity => "humidity",
            MessageKind::Alert => "alert",
            MessageKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Topic pattern is empty")]
    Empty,

    #[error("Multi-level wildcard '#' must be the last segment: {0}")]
    MisplacedMultiLevel(String),

    #[error("Wildcards must occupy a whole segment: {0}")]
    PartialWildcard(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `+`: exactly one segment
    SingleLevel,
    /// `#`: the remaining segments, including none
    MultiLevel,
}

/// A parsed MQTT topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }

        let parts: Vec<&str> = raw.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (idx, part) in parts.iter().enumerate() {
            let segment = match *part {
                "+" => Segment::SingleLevel,
                "#" if idx == last => Segment::MultiLevel,
                "#" => return Err(PatternError::MisplacedMultiLevel(raw.to_string())),
                other if other.contains('+') || other.contains('#') => {
                    return Err(PatternError::PartialWildcard(raw.to_string()))
                }
                other => Segment::Literal(other.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_segments = topic.split('/');

        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => {
                    if topic_segments.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => match topic_segments.next() {
                    Some(part) if part == literal => {}
                    _ => return false,
                },
            }
        }

        topic_segments.next().is_none()
    }
}

impl FromStr for TopicPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One subscription: the filter sent to the broker and the kind of message it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub pattern: TopicPattern,
    pub kind: MessageKind,
}

impl Subscription {
    pub fn new(pattern: TopicPattern, kind: MessageKind) -> Self {
        Self { pattern, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: MessageKind,
    pub source_id: String,
}

/// Maps inbound topics to a [`MessageKind`] and the embedded source id.
///
/// Classification is total: unmatched topics come back as `Unknown`, never as an error.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    routes: Vec<Subscription>,
    id_marker: String,
}

impl TopicRouter {
    pub fn new(id_marker: impl Into<String>) -> Self {
        Self {
            routes: Vec::new(),
            id_marker: id_marker.into(),
        }
    }

    pub fn from_subscriptions(id_marker: impl Into<String>, subscriptions: &[Subscription]) -> Self {
        Self {
            routes: subscriptions.to_vec(),
            id_marker: id_marker.into(),
        }
    }

    pub fn with_route(mut self, pattern: TopicPattern, kind: MessageKind) -> Self {
        self.routes.push(Subscription::new(pattern, kind));
        self
    }

    pub fn classify(&self, topic: &str) -> Classification {
        let kind = self
            .routes
            .iter()
            .find(|route| route.pattern.matches(topic))
            .map(|route| route.kind)
            .unwrap_or(MessageKind::Unknown);

        Classification {
            kind,
            source_id: extract_source_id(topic, &self.id_marker),
        }
    }
}

/// Returns the leading digit run of the segment following `marker`, or [`UNKNOWN_SOURCE`].
pub fn extract_source_id(topic: &str, marker: &str) -> String {
    let mut segments = topic.split('/');

    while let Some(segment) = segments.next() {
        if segment != marker {
            continue;
        }
        let digits: String = segments
            .next()
            .unwrap_or_default()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if !digits.is_empty() {
            return digits;
        }
    }

    UNKNOWN_SOURCE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pattern(raw: &str) -> TopicPattern {
        TopicPattern::parse(raw).unwrap()
    }

    fn router() -> TopicRouter {
        TopicRouter::new("E2025")
            .with_route(
                pattern("GTI700/Data/E2025/+/temperature"),
                MessageKind::Temperature,
            )
            .with_route(pattern("GTI700/Data/E2025/+/humidite"), MessageKind::Humidity)
            .with_route(pattern("GTI700/Alerts/E2025/+"), MessageKind::Alert)
    }

    #[test]
    fn single_level_wildcard_matches_exactly_one_segment() {
        let p = pattern("GTI700/Data/E2025/+/temperature");

        assert!(p.matches("GTI700/Data/E2025/05/temperature"));
        assert!(p.matches("GTI700/Data/E2025/12/temperature"));
        assert!(!p.matches("GTI700/Data/E2025/temperature"));
        assert!(!p.matches("GTI700/Data/E2025/05/06/temperature"));
        assert!(!p.matches("GTI700/Data/E2025/05/temperature/extra"));
    }

    #[test]
    fn multi_level_wildcard_matches_remaining_segments() {
        let p = pattern("GTI700/Data/#");

        assert!(p.matches("GTI700/Data"));
        assert!(p.matches("GTI700/Data/E2025/05/humidite"));
        assert!(!p.matches("GTI700/Alerts/E2025/05"));
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert_eq!(TopicPattern::parse(""), Err(PatternError::Empty));
        assert!(matches!(
            TopicPattern::parse("a/#/b"),
            Err(PatternError::MisplacedMultiLevel(_))
        ));
        assert!(matches!(
            TopicPattern::parse("a/b+/c"),
            Err(PatternError::PartialWildcard(_))
        ));
    }

    #[test]
    fn classifies_temperature_with_source_id() {
        for id in ["01", "05", "17", "123"] {
            let topic = format!("GTI700/Data/E2025/{id}/temperature");
            assert_eq!(
                router().classify(&topic),
                Classification {
                    kind: MessageKind::Temperature,
                    source_id: id.to_string(),
                }
            );
        }
    }

    #[test]
    fn classifies_humidity_and_alerts() {
        let r = router();

        let humidity = r.classify("GTI700/Data/E2025/08/humidite");
        assert_eq!(humidity.kind, MessageKind::Humidity);
        assert_eq!(humidity.source_id, "08");

        let alert = r.classify("GTI700/Alerts/E2025/03");
        assert_eq!(alert.kind, MessageKind::Alert);
        assert_eq!(alert.source_id, "03");
    }

    #[test]
    fn non_numeric_id_yields_sentinel() {
        let c = router().classify("GTI700/Data/E2025/team/temperature");

        assert_eq!(c.kind, MessageKind::Temperature);
        assert_eq!(c.source_id, UNKNOWN_SOURCE);
    }

    #[test]
    fn unmatched_topics_are_unknown() {
        let c = router().classify("GTI700/Status/Dashboard");

        assert_eq!(c.kind, MessageKind::Unknown);
        assert_eq!(c.source_id, UNKNOWN_SOURCE);
    }

    #[test]
    fn source_id_takes_leading_digits() {
        assert_eq!(extract_source_id("GTI700/Alerts/E2025/07b", "E2025"), "07");
        assert_eq!(extract_source_id("GTI700/Alerts/E2025", "E2025"), UNKNOWN_SOURCE);
    }

    #[test]
    fn first_matching_route_wins() {
        let r = TopicRouter::new("E2025")
            .with_route(pattern("GTI700/#"), MessageKind::Alert)
            .with_route(
                pattern("GTI700/Data/E2025/+/temperature"),
                MessageKind::Temperature,
            );

        assert_eq!(
            r.classify("GTI700/Data/E2025/05/temperature").kind,
            MessageKind::Alert
        );
    }
}
