//! Fixed-precision timestamp encoding.
//!
//! Timestamps are written as RFC 3339 with exactly six fractional digits and a
//! `Z` suffix, so lexicographic order of the encoded strings matches
//! chronological order in every backend.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Returns the current time truncated to the stored precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Encodes a timestamp in the stored format.
pub fn encode(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses an RFC 3339 timestamp, normalising to UTC and stored precision.
pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?
        .with_timezone(&Utc)
        .trunc_subsecs(6))
}

pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&encode(ts))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encode_uses_fixed_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(encode(&ts), "2024-05-01T12:00:00.000000Z");
    }

    #[test]
    fn encoded_order_matches_time_order() {
        let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = earlier + chrono::Duration::milliseconds(5);
        assert!(encode(&earlier) < encode(&later));
    }

    #[test]
    fn now_survives_encoding() {
        let ts = now();
        assert_eq!(parse(&encode(&ts)).unwrap(), ts);
    }

    #[test]
    fn parse_normalises_offsets() {
        let parsed = parse("2024-05-01T14:00:00+02:00").unwrap();
        assert_eq!(encode(&parsed), "2024-05-01T12:00:00.000000Z");
    }
}
