//! ==============================================================================
//! schema.rs - sensor id -> field name table
//! ==============================================================================
//!
//! ```text
//! purpose:
//!     labels the positional values inside a telemetry packet.
//!     the tracker firmware sends `<id>;<v1>,<v2>,...` and the meaning of each
//!     value depends only on the sensor id, so the whole decoding contract
//!     lives in this one table. adding a sensor is a one-line edit here.
//!
//! relationships:
//!     - used by: decoder.rs (lookup + zip), sink.rs (csv headers),
//!       server.rs (GET /api/schema)
//! ```
//!
//! ==============================================================================

use serde::Serialize;

/// small integer identifying the physical sensor that produced a packet
pub type SensorId = u8;

/// the sensors carried by the tracker payload
pub const SENSOR_SCHEMA: &[(SensorId, &[&str])] = &[
    (1, &["Latitude", "Longitude", "SIV"]),
    (2, &["Pressure", "Temperature", "Altitude"]),
    (3, &["X-Acceleration", "Y-Acceleration", "Z-Acceleration"]),
    (4, &["X-Gyro", "Y-Gyro", "Z-Gyro"]),
    (5, &["X-Magnet", "Y-Magnet", "Z-Magnet"]),
    (6, &["Temperature", "Humidity"]),
];

/// Immutable lookup from sensor id to its ordered field names.
///
/// Field order is the positional order of values in the packet.
#[derive(Debug, Clone, Copy)]
pub struct SchemaTable {
    entries: &'static [(SensorId, &'static [&'static str])],
}

impl SchemaTable {
    pub const fn new(entries: &'static [(SensorId, &'static [&'static str])]) -> Self {
        Self { entries }
    }

    /// field names for `id`, or `None` when the sensor is unsupported
    pub fn fields(&self, id: SensorId) -> Option<&'static [&'static str]> {
        self.entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, fields)| *fields)
    }

    pub fn contains(&self, id: SensorId) -> bool {
        self.fields(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SensorId, &'static [&'static str])> + '_ {
        self.entries.iter().map(|(id, fields)| (*id, *fields))
    }

    /// serializable view for the json api
    pub fn describe(&self) -> Vec<SensorSchema> {
        self.iter()
            .map(|(sensor_id, fields)| SensorSchema { sensor_id, fields: fields.to_vec() })
            .collect()
    }
}

impl Default for SchemaTable {
    fn default() -> Self {
        Self::new(SENSOR_SCHEMA)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSchema {
    pub sensor_id: SensorId,
    pub fields: Vec<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sensor_fields_in_order() {
        let table = SchemaTable::default();
        assert_eq!(
            table.fields(2),
            Some(&["Pressure", "Temperature", "Altitude"][..])
        );
        assert_eq!(table.fields(6).map(|f| f.len()), Some(2));
    }

    #[test]
    fn test_unknown_sensor_is_unsupported() {
        let table = SchemaTable::default();
        assert!(!table.contains(0));
        assert!(!table.contains(99));
        assert!(table.fields(7).is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let table = SchemaTable::default();
        let mut ids: Vec<_> = table.iter().map(|(id, _)| id).collect();
        let before = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }
}
