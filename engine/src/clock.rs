//! Event stamps for ordering changes by when they happened.
//!
//! Notifications can arrive in a different order than they occurred. The
//! stamp gives every change a total order that is independent of arrival.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// When a change occurred.
///
/// Ordering rules:
/// 1. Earlier `occurred_at` sorts first
/// 2. If equal, lower provider sequence sorts first
///
/// Two stamps are equal only for the same change observed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStamp {
    /// Milliseconds since the Unix epoch
    pub occurred_at: Timestamp,
    /// Provider sequence number, 0 when the provider has none
    #[serde(default)]
    pub seq: u64,
}

impl EventStamp {
    /// A stamp with no provider sequence.
    pub fn at(occurred_at: Timestamp) -> Self {
        Self { occurred_at, seq: 0 }
    }

    /// A stamp with an explicit provider sequence.
    pub fn with_seq(occurred_at: Timestamp, seq: u64) -> Self {
        Self { occurred_at, seq }
    }

    /// True if this stamp is strictly older than `other`.
    pub fn is_before(&self, other: &EventStamp) -> bool {
        self < other
    }
}

impl Ord for EventStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.occurred_at.cmp(&other.occurred_at) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            other => other,
        }
    }
}

impl PartialOrd for EventStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_by_time() {
        assert!(EventStamp::at(1) < EventStamp::at(2));
        assert!(EventStamp::at(1).is_before(&EventStamp::at(2)));
        assert!(!EventStamp::at(2).is_before(&EventStamp::at(1)));
    }

    #[test]
    fn sequence_breaks_ties() {
        let first = EventStamp::with_seq(1000, 4);
        let second = EventStamp::with_seq(1000, 5);
        assert!(first < second);
        // time dominates sequence
        assert!(EventStamp::with_seq(999, 100) < first);
    }

    #[test]
    fn equal_stamps_are_not_before() {
        let a = EventStamp::with_seq(1000, 1);
        assert!(!a.is_before(&a));
    }

    #[test]
    fn serialization_format() {
        let json = serde_json::to_string(&EventStamp::with_seq(10, 2)).unwrap();
        assert_eq!(json, r#"{"occurredAt":10,"seq":2}"#);

        let parsed: EventStamp = serde_json::from_str(r#"{"occurredAt":10}"#).unwrap();
        assert_eq!(parsed, EventStamp::at(10));
    }
}
