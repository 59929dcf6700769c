//! ==============================================================================
//! decoder.rs - raw serial line -> DecodedReading
//! ==============================================================================
//!
//! ```text
//! purpose:
//!     turns one line printed by the ground-station receiver into a labeled
//!     reading. the receiver prints a lot besides packets:
//!
//!         RFM 95 Receiver ready!
//!         Received packet: [2;1013.25,23.5,100.0]
//!         RSSI: -41.00 dBm, SNR: 9.75 dB
//!         No packet received, RX timeout.
//!
//!     only lines carrying a packet envelope (`<prefix> [ ... ]`) are decoded.
//!     everything else is skipped without producing an error, otherwise every
//!     rx timeout would end up on the viewers' error channel.
//!
//! algorithm (single pass, no backtracking):
//!     1. trim, match a known prefix            -> no match: Ok(None)
//!     2. strip `[` `]`                         -> MalformedFraming
//!     3. split on `;`, keep first two segments -> MalformedFraming
//!     4. look up id in the schema table        -> UnsupportedSensorId
//!     5. split values on `,`, parse as f64     -> NaN (or NonNumericValue)
//!     6. zip with schema names, shorter wins   -> (or FieldCountMismatch)
//!     7. stamp with clock.now()
//!
//! relationships:
//!     - uses: schema.rs (field names), domain.rs (output types)
//!     - used by: ingest.rs
//! ```
//!
//! ==============================================================================

use crate::domain::{DecodeError, DecodeErrorKind, DecodedReading, Field};
use crate::schema::{SchemaTable, SensorId};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// prefixes printed by the receiver and transmitter firmware
pub const DEFAULT_PREFIXES: &[&str] = &["Received packet:", "Sent packet:"];

/// source of reading timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// always returns the same instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// How strictly packet contents are validated.
///
/// The default is permissive: non-numeric tokens become `NaN` and value
/// counts that disagree with the schema are truncated to the shorter side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct DecodePolicy {
    #[serde(default)]
    pub reject_non_numeric: bool,
    #[serde(default)]
    pub reject_field_count_mismatch: bool,
}

#[derive(Debug, Clone)]
pub struct PacketDecoder {
    schema: SchemaTable,
    prefixes: Vec<String>,
    policy: DecodePolicy,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(SchemaTable::default())
    }
}

impl PacketDecoder {
    pub fn new(schema: SchemaTable) -> Self {
        Self {
            schema,
            prefixes: DEFAULT_PREFIXES.iter().map(|p| p.to_string()).collect(),
            policy: DecodePolicy::default(),
        }
    }

    pub fn with_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: DecodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn schema(&self) -> &SchemaTable {
        &self.schema
    }

    /// Decode one raw line.
    ///
    /// Returns `Ok(None)` for lines without a packet envelope (diagnostics,
    /// timeouts, banners). Never panics on any input.
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use groundstation_host::{FixedClock, PacketDecoder};
    ///
    /// let clock = FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    /// let decoder = PacketDecoder::default();
    ///
    /// let reading = decoder
    ///     .decode("Received packet: [2;1013.25,23.5,100.0]", &clock)
    ///     .unwrap()
    ///     .unwrap();
    /// assert_eq!(reading.get("Pressure"), Some(1013.25));
    ///
    /// assert!(decoder.decode("No packet received, RX timeout", &clock).unwrap().is_none());
    /// ```
    pub fn decode(
        &self,
        raw: &str,
        clock: &dyn Clock,
    ) -> Result<Option<DecodedReading>, DecodeError> {
        let line = raw.trim();
        let Some(rest) = self.strip_prefix(line) else {
            return Ok(None);
        };

        let content = rest
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| {
                DecodeError::new(
                    line,
                    DecodeErrorKind::MalformedFraming,
                    "Malformed packet: expected '[<id>;<values>]'",
                )
            })?;

        // segments past the second `;` are ignored
        let mut segments = content.split(';');
        let id_segment = segments.next().unwrap_or_default();
        let values_segment = segments.next().ok_or_else(|| {
            DecodeError::new(
                line,
                DecodeErrorKind::MalformedFraming,
                "Malformed packet: missing ';' between sensor id and values",
            )
        })?;

        let id_segment = id_segment.trim();
        let (sensor_id, names) = id_segment
            .parse::<SensorId>()
            .ok()
            .and_then(|id| self.schema.fields(id).map(|names| (id, names)))
            .ok_or_else(|| {
                DecodeError::new(
                    line,
                    DecodeErrorKind::UnsupportedSensorId,
                    format!("Unsupported sensor ID: {}", id_segment),
                )
            })?;

        let mut values = Vec::with_capacity(names.len());
        for (position, token) in values_segment.split(',').enumerate() {
            let token = token.trim();
            match token.parse::<f64>() {
                Ok(v) => values.push(v),
                Err(_) if self.policy.reject_non_numeric => {
                    return Err(DecodeError::new(
                        line,
                        DecodeErrorKind::NonNumericValue,
                        format!(
                            "Non-numeric value '{}' at position {} for sensor {}",
                            token, position, sensor_id
                        ),
                    ));
                }
                Err(_) => values.push(f64::NAN),
            }
        }

        if self.policy.reject_field_count_mismatch && values.len() != names.len() {
            return Err(DecodeError::new(
                line,
                DecodeErrorKind::FieldCountMismatch,
                format!(
                    "Sensor {} expects {} values, got {}",
                    sensor_id,
                    names.len(),
                    values.len()
                ),
            ));
        }

        let fields = names
            .iter()
            .zip(values)
            .map(|(&name, value)| Field { name, value })
            .collect();

        Ok(Some(DecodedReading {
            sensor_id,
            fields,
            timestamp: clock.now(),
        }))
    }

    fn strip_prefix<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.prefixes
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix.as_str()))
    }
}
