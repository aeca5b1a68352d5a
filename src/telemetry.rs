use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::{Coordinate, ABNORMAL_LABEL, ABNORMAL_LABEL_KO};

/// The wall clock format the sensor unit stamps its messages with
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reasons an inbound payload is discarded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no timestamp in message")]
    MissingTimestamp,
    #[error("timestamp parsing error: {0}")]
    BadTimestamp(#[from] chrono::ParseError),
}

/// The classifier label attached to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction(String);

impl Prediction {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn is_abnormal(&self) -> bool {
        matches!(self.0.as_str(), ABNORMAL_LABEL | ABNORMAL_LABEL_KO)
    }
}

/// The JSON layout published by the vehicle
#[derive(Deserialize)]
struct RawTelemetry {
    timestamp: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    mq_value: Option<f64>,
    /// `Some` whenever the key is present, even as null or a non-string
    #[serde(default, deserialize_with = "present")]
    prediction: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// One decoded unit of telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub timestamp: NaiveDateTime,
    pub location: Option<Coordinate>,
    pub mq_value: Option<f64>,
    pub prediction: Option<Prediction>,
}

impl TelemetryMessage {
    /// Decode a raw payload.  A location is only reported when both coordinates are present.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawTelemetry = serde_json::from_slice(payload)?;
        let Some(timestamp) = raw.timestamp.filter(|t| !t.is_empty()) else {
            return Err(DecodeError::MissingTimestamp);
        };
        let timestamp = NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT)?;

        let location = match (raw.latitude, raw.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinate {
                latitude,
                longitude,
            }),
            _ => None,
        };

        Ok(TelemetryMessage {
            timestamp,
            location,
            mq_value: raw.mq_value,
            prediction: raw.prediction.map(|label| match label {
                Value::String(label) => Prediction(label),
                other => Prediction(other.to_string()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_full_message() {
        let msg = TelemetryMessage::decode(
            br#"{"timestamp":"2024-11-02 13:05:09","latitude":37.5665,"longitude":126.978,"mq_value":412.0,"prediction":"abnormal"}"#,
        )
        .unwrap();
        assert_eq!(msg.timestamp.to_string(), "2024-11-02 13:05:09");
        assert_eq!(
            msg.location,
            Some(Coordinate {
                latitude: 37.5665,
                longitude: 126.978
            })
        );
        assert_eq!(msg.mq_value, Some(412.0));
        assert!(msg.prediction.unwrap().is_abnormal());
    }

    #[test]
    fn half_a_coordinate_is_no_location() {
        let msg =
            TelemetryMessage::decode(br#"{"timestamp":"2024-11-02 13:05:09","latitude":37.5}"#)
                .unwrap();
        assert_eq!(msg.location, None);
        assert_eq!(msg.prediction, None);
    }

    #[test]
    fn null_coordinates_are_no_location() {
        let msg = TelemetryMessage::decode(
            br#"{"timestamp":"2024-11-02 13:05:09","latitude":null,"longitude":null,"mq_value":120.0}"#,
        )
        .unwrap();
        assert_eq!(msg.location, None);
        assert_eq!(msg.mq_value, Some(120.0));
    }

    #[test]
    fn korean_label_is_abnormal() {
        assert!(Prediction::new("비정상").is_abnormal());
        assert!(!Prediction::new("정상").is_abnormal());
        assert!(!Prediction::new("normal").is_abnormal());
    }

    #[test]
    fn present_prediction_of_any_type_is_kept() {
        for payload in [
            br#"{"timestamp":"2024-11-02 13:05:09","prediction":null}"#.as_slice(),
            br#"{"timestamp":"2024-11-02 13:05:09","prediction":0}"#.as_slice(),
            br#"{"timestamp":"2024-11-02 13:05:09","prediction":["abnormal"]}"#.as_slice(),
        ] {
            let msg = TelemetryMessage::decode(payload).unwrap();
            let prediction = msg.prediction.expect("prediction key is present");
            assert!(!prediction.is_abnormal(), "{}", prediction.label());
        }
    }

    #[test]
    fn rejects_truncated_json() {
        let err = TelemetryMessage::decode(br#"{"mq_value": "oops""#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn rejects_non_numeric_reading() {
        let err = TelemetryMessage::decode(
            br#"{"timestamp":"2024-11-02 13:05:09","mq_value":"oops"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn rejects_missing_timestamp() {
        let err = TelemetryMessage::decode(br#"{"latitude":1.0,"longitude":2.0}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingTimestamp));
    }

    #[test]
    fn rejects_bad_timestamp() {
        let err = TelemetryMessage::decode(br#"{"timestamp":"02/11/2024 13:05"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::BadTimestamp(_)));
    }
}
