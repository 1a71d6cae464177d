use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single ticker price observation produced by the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub key: String,
    pub value: f64,
    pub event_time: DateTime<Utc>,
}

impl Event {
    pub fn new(key: impl Into<String>, value: f64, event_time: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            value,
            event_time,
        }
    }
}

/// Identifies one aggregation unit: a key and a half-open `[start, end)` interval.
///
/// Ordered by key first, then window start, so a sorted index iterates each
/// key's windows in time order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub key: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowKey {
    /// Floor-aligns `at` to a multiple of `length` since the epoch.
    pub fn tumbling(key: impl Into<String>, at: DateTime<Utc>, length: Duration) -> Self {
        let size_ms = length.num_milliseconds().max(1);
        let buckets = at.timestamp_millis().div_euclid(size_ms);
        let start = DateTime::<Utc>::from_timestamp_millis(buckets * size_ms).unwrap_or_default();
        Self {
            key: key.into(),
            start,
            end: start + Duration::milliseconds(size_ms),
        }
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    /// A window is closed once the processing clock reaches its end.
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }
}

/// Finalized output of one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub key: String,
    pub window_start: DateTime<Utc>,
    pub average: f64,
}

/// Wire shape of a delivered result.
///
/// `price` carries the window average and `event_time` the window start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub ticker: String,
    pub price: f64,
    #[serde(rename = "eventTime")]
    pub event_time: DateTime<Utc>,
}

impl From<&AggregateResult> for OutputRecord {
    fn from(r: &AggregateResult) -> Self {
        Self {
            ticker: r.key.clone(),
            price: r.average,
            event_time: r.window_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tumbling_key_is_floor_aligned() {
        let at = DateTime::<Utc>::from_timestamp_millis(1_700_000_007_250).unwrap();
        let w = WindowKey::tumbling("AAPL", at, Duration::seconds(10));
        assert_eq!(w.start.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(w.end.timestamp_millis(), 1_700_000_010_000);
        assert_eq!(w.length(), Duration::seconds(10));
        assert!(!w.is_closed_at(at));
        assert!(w.is_closed_at(w.end));
    }

    #[test]
    fn boundary_instant_opens_the_next_window() {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_010, 0).unwrap();
        let w = WindowKey::tumbling("AAPL", at, Duration::seconds(10));
        assert_eq!(w.start, at);
    }

    #[test]
    fn output_record_wire_format() {
        let result = AggregateResult {
            key: "AAPL".into(),
            window_start: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            average: 10.5,
        };
        let v = serde_json::to_value(OutputRecord::from(&result)).unwrap();
        assert_eq!(v["ticker"], serde_json::json!("AAPL"));
        assert_eq!(v["price"], serde_json::json!(10.5));
        assert_eq!(v["eventTime"], serde_json::json!("2023-11-14T22:13:20Z"));
    }
}
