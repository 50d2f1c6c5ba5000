use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse label for an event's time span.
///
/// Boundaries sit at the halfway points between natural units, so a span is
/// labeled with the unit it is closest to: 45 seconds reads better as "about
/// a minute" than as "45 seconds".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    /// Label for an elapsed span of `secs` seconds.
    pub fn for_span_seconds(secs: u64) -> Self {
        match secs {
            0..=29 => Granularity::Second,
            30..=1_799 => Granularity::Minute,
            1_800..=43_199 => Granularity::Hour,
            43_200..=604_799 => Granularity::Day,
            604_800..=1_209_599 => Granularity::Week,
            _ => Granularity::Month,
        }
    }
}

/// If `payload` carries `from_iso` and `to_iso` (RFC 3339), compute the
/// elapsed span and attach a `granularity` field to it.
///
/// Returns the derived label, or None when the payload has no parsable span.
/// A span that runs backwards is treated as zero.
pub fn attach_granularity(payload: &mut serde_json::Value) -> Option<Granularity> {
    let from = parse_iso(payload.get("from_iso")?)?;
    let to = parse_iso(payload.get("to_iso")?)?;
    let delta = (to - from).num_seconds().max(0) as u64;
    let granularity = Granularity::for_span_seconds(delta);
    payload.as_object_mut()?.insert(
        "granularity".to_string(),
        serde_json::Value::String(granularity.as_str().to_string()),
    );
    Some(granularity)
}

fn parse_iso(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
