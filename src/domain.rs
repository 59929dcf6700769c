//! decoded telemetry and the message shape pushed to viewers

use crate::schema::SensorId;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// one labeled value of a reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    pub name: &'static str,
    /// `NaN` when the packet carried a non-numeric token
    pub value: f64,
}

/// a packet that decoded against the schema table
///
/// fields are kept in schema order. fields the packet did not carry a value
/// for (short packets) are absent rather than zero.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub sensor_id: SensorId,
    pub fields: Vec<Field>,
    pub timestamp: DateTime<Utc>,
}

impl DecodedReading {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.value)
    }

    /// rfc 3339 with millisecond precision, e.g. `2024-05-01T12:00:00.000Z`
    pub fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeErrorKind {
    /// envelope brackets or the `;` separator are missing
    MalformedFraming,
    NonNumericValue,
    UnsupportedSensorId,
    FieldCountMismatch,
}

/// a line that carried the packet envelope but could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DecodeError {
    pub raw_line: String,
    pub reason: DecodeErrorKind,
    pub message: String,
}

impl DecodeError {
    pub fn new(raw_line: &str, reason: DecodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            raw_line: raw_line.to_string(),
            reason,
            message: message.into(),
        }
    }
}

/// everything the ingest loop publishes
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Reading(DecodedReading),
    Error(DecodeError),
}

impl TelemetryEvent {
    pub fn to_wire(&self) -> WireMessage<'_> {
        match self {
            TelemetryEvent::Reading(reading) => WireMessage {
                kind: WireKind::Sensor,
                sensor_id: Some(reading.sensor_id),
                data: Some(FieldMap(&reading.fields)),
                timestamp: Some(reading.timestamp_string()),
                reason: None,
                message: None,
            },
            TelemetryEvent::Error(err) => WireMessage {
                kind: WireKind::Error,
                sensor_id: None,
                data: None,
                timestamp: None,
                reason: Some(err.reason),
                message: Some(&err.message),
            },
        }
    }
}

impl From<DecodedReading> for TelemetryEvent {
    fn from(reading: DecodedReading) -> Self {
        TelemetryEvent::Reading(reading)
    }
}

impl From<DecodeError> for TelemetryEvent {
    fn from(err: DecodeError) -> Self {
        TelemetryEvent::Error(err)
    }
}

// ==============================================================================
// wire format
// ==============================================================================
// one json text frame per event:
//   {"kind":"sensor","sensorId":2,"data":{"Pressure":1013.25,...},"timestamp":"..."}
//   {"kind":"error","reason":"unsupported_sensor_id","message":"Unsupported sensor ID: 99"}
// non-finite values are written as null by serde_json.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Sensor,
    Error,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage<'a> {
    pub kind: WireKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<SensorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<FieldMap<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DecodeErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'a str>,
}

/// serializes fields as a json object in schema order
#[derive(Debug)]
pub struct FieldMap<'a>(pub &'a [Field]);

impl Serialize for FieldMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for field in self.0 {
            map.serialize_entry(field.name, &field.value)?;
        }
        map.end()
    }
}
