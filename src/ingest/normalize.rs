//! Turns a raw MQTT payload into a validated [`NewReading`].
//!
//! Device firmware in the field is not consistent about field names, so each
//! logical field accepts a small alias set, tried in declared order. This
//! module is pure: no I/O, no clock reads (the delivery time is an argument).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::db::models::NewReading;
use crate::error::{DaemonError, Result};

/// Alias sets, first match wins.
const MOISTURE_ALIASES: &[&str] = &["moisture", "moisture_level"];
const TEMPERATURE_ALIASES: &[&str] = &["temperature", "temp"];
const HUMIDITY_ALIASES: &[&str] = &["humidity"];
const BATTERY_ALIASES: &[&str] = &["battery", "battery_level"];
const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "time"];

/// Normalize one inbound message into a reading ready for persistence.
///
/// `sensor_id` comes from the payload when present, otherwise from the second
/// topic segment (`moisture/{sensor_id}/data`). Moisture is mandatory; the
/// other measurements are optional and are omitted (never zeroed) when absent
/// or non-numeric.
pub fn normalize(topic: &str, payload: &[u8], delivered_at: DateTime<Utc>) -> Result<NewReading> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DaemonError::validation("payload is not valid UTF-8"))?;

    let value: Value = serde_json::from_str(text)
        .map_err(|e| DaemonError::validation(format!("payload is not valid JSON: {e}")))?;

    let fields = value
        .as_object()
        .ok_or_else(|| DaemonError::validation("payload is not a JSON object"))?;

    let sensor_id = fields
        .get("sensor_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| sensor_id_from_topic(topic))
        .ok_or_else(|| {
            DaemonError::validation("sensor_id missing from payload and not derivable from topic")
        })?;

    let moisture_level = first_numeric(fields, MOISTURE_ALIASES)
        .ok_or_else(|| DaemonError::validation("moisture field absent or non-numeric"))?;

    let (recorded_at, device_timestamp) = match first_value(fields, TIMESTAMP_ALIASES)
        .and_then(parse_timestamp)
    {
        Some(ts) => (ts, true),
        None => (delivered_at, false),
    };

    Ok(NewReading {
        sensor_id,
        recorded_at,
        device_timestamp,
        moisture_level,
        temperature: first_numeric(fields, TEMPERATURE_ALIASES),
        humidity: first_numeric(fields, HUMIDITY_ALIASES),
        battery_level: first_numeric(fields, BATTERY_ALIASES),
        raw_payload: text.to_owned(),
    })
}

/// Extract the sensor id from a `moisture/{sensor_id}/data` style topic.
fn sensor_id_from_topic(topic: &str) -> Option<String> {
    let mut parts = topic.split('/');
    let _prefix = parts.next()?;
    let id = parts.next()?;
    (!id.is_empty()).then(|| id.to_owned())
}

fn first_value<'a>(
    fields: &'a serde_json::Map<String, Value>,
    aliases: &[&str],
) -> Option<&'a Value> {
    aliases.iter().find_map(|k| fields.get(*k))
}

/// First alias present wins; its value is read as a number, accepting a
/// numeric string as well (some firmware quotes everything).
fn first_numeric(fields: &serde_json::Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    first_value(fields, aliases).and_then(as_f64)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a device-supplied timestamp. Naive formats are read as UTC.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(naive.and_utc());
                }
            }
            None
        }
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn delivered() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 12, 9, 30, 0).unwrap()
    }

    #[test]
    fn full_payload_maps_every_field() {
        let payload = br#"{"sensor_id":"s1","moisture":42.0,"temperature":21.5,"humidity":55.0,"battery":80}"#;
        let r = normalize("moisture/s1/data", payload, delivered()).unwrap();

        assert_eq!(r.sensor_id, "s1");
        assert_eq!(r.moisture_level, 42.0);
        assert_eq!(r.temperature, Some(21.5));
        assert_eq!(r.humidity, Some(55.0));
        assert_eq!(r.battery_level, Some(80.0));
        assert!(!r.device_timestamp);
        assert_eq!(r.recorded_at, delivered());
    }

    #[test]
    fn alias_spellings_produce_the_same_reading() {
        let a = normalize(
            "moisture/s1/data",
            br#"{"moisture":42.0,"temp":21.5,"battery":80}"#,
            delivered(),
        )
        .unwrap();
        let b = normalize(
            "moisture/s1/data",
            br#"{"moisture_level":42.0,"temperature":21.5,"battery_level":80}"#,
            delivered(),
        )
        .unwrap();

        assert_eq!(a.moisture_level, b.moisture_level);
        assert_eq!(a.temperature, b.temperature);
        assert_eq!(a.battery_level, b.battery_level);
        assert_eq!(a.sensor_id, b.sensor_id);
        assert_ne!(a.raw_payload, b.raw_payload);
    }

    #[test]
    fn sensor_id_falls_back_to_topic_segment() {
        let r = normalize("moisture/zoneA/data", br#"{"moisture_level":10.0}"#, delivered())
            .unwrap();
        assert_eq!(r.sensor_id, "zoneA");
        assert_eq!(r.moisture_level, 10.0);
    }

    #[test]
    fn payload_sensor_id_wins_over_topic() {
        let r = normalize("moisture/zoneA/data", br#"{"sensor_id":"s9","moisture":1}"#, delivered())
            .unwrap();
        assert_eq!(r.sensor_id, "s9");
    }

    #[test]
    fn missing_moisture_is_rejected_under_any_alias() {
        for payload in [
            br#"{"sensor_id":"s1","temperature":20.0}"#.as_slice(),
            br#"{"sensor_id":"s1","moisture":"damp"}"#.as_slice(),
            br#"{"sensor_id":"s1"}"#.as_slice(),
        ] {
            let err = normalize("moisture/s1/data", payload, delivered()).unwrap_err();
            assert!(err.to_string().contains("moisture"), "payload: {payload:?}");
        }
    }

    #[test]
    fn non_json_payload_is_rejected() {
        let err = normalize("moisture/s1/data", b"not json at all", delivered()).unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }

    #[test]
    fn non_object_json_is_rejected() {
        let err = normalize("moisture/s1/data", b"[1,2,3]", delivered()).unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }

    #[test]
    fn bare_topic_yields_no_sensor_id() {
        let err = normalize("moisture", br#"{"moisture":5.0}"#, delivered()).unwrap_err();
        assert!(err.to_string().contains("sensor_id"));
    }

    #[test]
    fn optional_fields_absent_stay_absent() {
        let r = normalize("moisture/s1/data", br#"{"moisture":0.0}"#, delivered()).unwrap();
        // Zero moisture is a real value, not a missing one.
        assert_eq!(r.moisture_level, 0.0);
        assert_eq!(r.temperature, None);
        assert_eq!(r.humidity, None);
        assert_eq!(r.battery_level, None);
    }

    #[test]
    fn non_numeric_optional_fields_are_omitted() {
        let r = normalize(
            "moisture/s1/data",
            br#"{"moisture":3.0,"temperature":"warm","battery":null}"#,
            delivered(),
        )
        .unwrap();
        assert_eq!(r.temperature, None);
        assert_eq!(r.battery_level, None);
    }

    #[test]
    fn quoted_numbers_are_accepted() {
        let r = normalize("moisture/s1/data", br#"{"moisture":"42.5","battery":"80"}"#, delivered())
            .unwrap();
        assert_eq!(r.moisture_level, 42.5);
        assert_eq!(r.battery_level, Some(80.0));
    }

    #[test]
    fn device_timestamp_rfc3339_is_preserved() {
        let r = normalize(
            "moisture/s1/data",
            br#"{"moisture":1.0,"timestamp":"2025-10-11T08:00:00Z"}"#,
            delivered(),
        )
        .unwrap();
        assert!(r.device_timestamp);
        assert_eq!(r.recorded_at, Utc.with_ymd_and_hms(2025, 10, 11, 8, 0, 0).unwrap());
    }

    #[test]
    fn device_timestamp_space_separated_is_read_as_utc() {
        let r = normalize(
            "moisture/s1/data",
            br#"{"moisture":1.0,"time":"2025-10-11 08:00:00"}"#,
            delivered(),
        )
        .unwrap();
        assert!(r.device_timestamp);
        assert_eq!(r.recorded_at, Utc.with_ymd_and_hms(2025, 10, 11, 8, 0, 0).unwrap());
    }

    #[test]
    fn unix_seconds_timestamp_is_accepted() {
        let r = normalize(
            "moisture/s1/data",
            br#"{"moisture":1.0,"timestamp":1760169600}"#,
            delivered(),
        )
        .unwrap();
        assert!(r.device_timestamp);
        assert_eq!(r.recorded_at.timestamp(), 1_760_169_600);
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_delivery_time() {
        let r = normalize(
            "moisture/s1/data",
            br#"{"moisture":1.0,"timestamp":"sometime yesterday"}"#,
            delivered(),
        )
        .unwrap();
        assert!(!r.device_timestamp);
        assert_eq!(r.recorded_at, delivered());
    }
}
