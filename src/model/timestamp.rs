use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ArborError, ArborResult};

// ---------------------------------------------------------------------------
// Timestamp: total-ordered instants with microsecond resolution
// ---------------------------------------------------------------------------

/// A point in time with microsecond resolution, usable both as a value and
/// as its canonical ISO-8601 UTC string. The open end of a validity interval
/// is represented as `Option<Timestamp>::None`, never as a sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Current time, truncated to microsecond resolution.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Build from a chrono datetime, truncating sub-microsecond precision.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let micros = dt.timestamp_micros();
        // timestamp_micros is always in range for dates chrono can represent
        Timestamp(DateTime::from_timestamp_micros(micros).unwrap_or(dt))
    }

    /// Parse a canonical ISO-8601 / RFC-3339 string.
    pub fn parse(value: &str) -> ArborResult<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|e| ArborError::Internal(format!("invalid timestamp {:?}: {}", value, e)))?;
        Ok(Self::from_datetime(parsed.with_timezone(&Utc)))
    }

    /// Resolve an optional input: `None` means now.
    pub fn or_now(value: Option<Timestamp>) -> Self {
        value.unwrap_or_else(Timestamp::now)
    }

    /// Canonical serialized form: ISO-8601 UTC with microseconds.
    pub fn to_rfc3339(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
    }

    /// Shift by a number of microseconds (negative moves into the past).
    pub fn add_micros(&self, micros: i64) -> Self {
        Timestamp(self.0 + Duration::microseconds(micros))
    }

    pub fn inner(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timestamp::parse(s)
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.to_rfc3339()
    }
}

impl TryFrom<String> for Timestamp {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timestamp::parse(&value).map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_roundtrip_through_string() {
        let ts = Timestamp::now();
        let parsed = Timestamp::parse(&ts.to_rfc3339()).unwrap();
        assert_eq!(ts, parsed);
    }

    #[test]
    fn test_ordering() {
        let t0 = Timestamp::now();
        let t1 = t0.add_micros(1);
        assert!(t0 < t1);
        assert!(t1.add_micros(-1) == t0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Timestamp::parse("not-a-time").is_err());
    }

    #[test]
    fn test_canonical_form_has_micros() {
        let ts = Timestamp::parse("2023-01-15T10:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2023-01-15T10:00:00.000000Z");
    }

    proptest! {
        // The canonical string form must preserve the total order, because
        // the backend compares serialized timestamps lexicographically.
        #[test]
        fn prop_string_order_matches_value_order(a in 0i64..4_000_000_000_000_000, b in 0i64..4_000_000_000_000_000) {
            let base = Timestamp::parse("2000-01-01T00:00:00Z").unwrap();
            let ta = base.add_micros(a);
            let tb = base.add_micros(b);
            prop_assert_eq!(ta.cmp(&tb), ta.to_rfc3339().cmp(&tb.to_rfc3339()));
        }

        #[test]
        fn prop_roundtrip(offset in 0i64..4_000_000_000_000_000) {
            let base = Timestamp::parse("2000-01-01T00:00:00Z").unwrap();
            let ts = base.add_micros(offset);
            prop_assert_eq!(ts, Timestamp::parse(&ts.to_rfc3339()).unwrap());
        }
    }
}
