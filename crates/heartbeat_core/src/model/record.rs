//! Canonical wire/storage record derived from a [`Sample`].
//!
//! # Invariants
//! - One record per sample; `bpm` is the sample value rounded to nearest.
//! - Instants are kept at millisecond precision so the payload and the
//!   timestamp key agree and the payload round-trips exactly.
//! - Payload timestamps are RFC 3339 with an explicit `Z` offset.

use crate::model::sample::Sample;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Storage form of one sample, written verbatim to every sink location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub bpm: u32,
    #[serde(with = "iso8601_millis")]
    pub start: DateTime<Utc>,
    #[serde(with = "iso8601_millis")]
    pub end: DateTime<Utc>,
    pub source: String,
}

impl CanonicalRecord {
    /// Converts a validated sample into its canonical record.
    pub fn from_sample(sample: &Sample) -> Self {
        // Sample validation guarantees a finite, non-negative value; the cast
        // saturates for absurdly large readings.
        let bpm = sample.bpm().round() as u32;
        Self {
            bpm,
            start: sample.start().trunc_subsecs(3),
            end: sample.end().trunc_subsecs(3),
            source: sample.source_name().to_string(),
        }
    }

    /// Sink key for this record, see [`timestamp_key`].
    pub fn key(&self) -> String {
        timestamp_key(self.end)
    }

    /// JSON payload `{ bpm, start, end, source }`.
    pub fn to_payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    /// Parses a payload previously produced by [`Self::to_payload`] or by
    /// another writer using the same shape.
    pub fn from_payload(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

impl From<&Sample> for CanonicalRecord {
    fn from(value: &Sample) -> Self {
        Self::from_sample(value)
    }
}

/// Decimal millisecond unix epoch of `end`, used as the history key.
///
/// The key is not zero-padded. Stores that enumerate keys must order by
/// `(length, text)` to get numeric order across digit-count changes.
pub fn timestamp_key(end: DateTime<Utc>) -> String {
    end.timestamp_millis().to_string()
}

mod iso8601_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::{timestamp_key, CanonicalRecord};
    use crate::model::sample::Sample;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn at(ms: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn rounds_bpm_to_nearest_integer() {
        let low = Sample::instant(71.49, at(1_000), "Watch").unwrap();
        let high = Sample::instant(71.5, at(1_000), "Watch").unwrap();
        assert_eq!(CanonicalRecord::from_sample(&low).bpm, 71);
        assert_eq!(CanonicalRecord::from_sample(&high).bpm, 72);
    }

    #[test]
    fn key_is_decimal_epoch_millis_of_end() {
        let sample = Sample::new(60.0, at(1_700_000_000_000), at(1_700_000_060_123), "Watch")
            .unwrap();
        let record = CanonicalRecord::from(&sample);
        assert_eq!(record.key(), "1700000060123");
        assert_eq!(timestamp_key(at(999_999_999_999)), "999999999999");
    }

    #[test]
    fn payload_uses_millisecond_iso8601_with_zulu_offset() {
        let sample = Sample::new(72.0, at(1_700_000_000_000), at(1_700_000_005_250), "Watch")
            .unwrap();
        let payload = CanonicalRecord::from_sample(&sample).to_payload().unwrap();
        assert_eq!(
            payload,
            json!({
                "bpm": 72,
                "start": "2023-11-14T22:13:20.000Z",
                "end": "2023-11-14T22:13:25.250Z",
                "source": "Watch",
            })
        );
    }

    #[test]
    fn payload_round_trip_preserves_every_field() {
        let sample = Sample::new(88.2, at(1_710_000_000_001), at(1_710_000_000_999), "Chest Strap")
            .unwrap();
        let record = CanonicalRecord::from_sample(&sample);
        let parsed = CanonicalRecord::from_payload(record.to_payload().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn parses_payload_written_with_non_utc_offset() {
        let parsed = CanonicalRecord::from_payload(json!({
            "bpm": 64,
            "start": "2024-03-01T10:00:00+01:00",
            "end": "2024-03-01T10:00:05.500+01:00",
            "source": "Watch",
        }))
        .unwrap();
        assert_eq!(parsed.end, at(1_709_283_605_500));
        assert_eq!(parsed.key(), "1709283605500");
    }

    #[test]
    fn sub_millisecond_precision_is_truncated() {
        let end = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let sample = Sample::instant(60.0, end, "Watch").unwrap();
        let record = CanonicalRecord::from_sample(&sample);
        assert_eq!(record.end, at(1_700_000_000_123));
        let parsed = CanonicalRecord::from_payload(record.to_payload().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }
}
