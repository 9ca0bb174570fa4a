use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Closed set of sensor kinds the replay engine understands.
///
/// Wire names are the snake_case forms (`grid_power`, `pump_ext_temp`, ...)
/// used both in serialized events and in ingestion mappings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SensorType {
    GridPower,
    PvPower,
    PumpConsumption,
    PumpProduction,
    PumpExtTemp,
    EnergyPrice,
    PumpCop,
    PumpCompressorSpeed,
    PumpFanSpeed,
    PumpDischargeTemp,
    PumpHighPressure,
    PumpFlow,
    PumpInletTemp,
    PumpOutletTemp,
    PumpDhwTemp,
    PumpOutsidePipe,
    PumpInsidePipeTemp,
    PumpZ1TargetTemp,
    GridVoltage,
    GridPowerFactor,
    GridPowerReactive,
}

impl SensorType {
    /// Heat-pump diagnostic channels (everything the `hp:diagnostics`
    /// snapshot is built from).
    pub fn is_hp_diagnostic(self) -> bool {
        matches!(
            self,
            SensorType::PumpCop
                | SensorType::PumpCompressorSpeed
                | SensorType::PumpFanSpeed
                | SensorType::PumpDischargeTemp
                | SensorType::PumpHighPressure
                | SensorType::PumpFlow
                | SensorType::PumpInletTemp
                | SensorType::PumpOutletTemp
                | SensorType::PumpDhwTemp
                | SensorType::PumpOutsidePipe
                | SensorType::PumpInsidePipeTemp
                | SensorType::PumpZ1TargetTemp
        )
    }

    pub fn is_power_quality(self) -> bool {
        matches!(
            self,
            SensorType::GridVoltage | SensorType::GridPowerFactor | SensorType::GridPowerReactive
        )
    }
}

/// A single immutable sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
}

/// Sensor metadata registered during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub name: String,
    pub sensor_type: SensorType,
    pub unit: String,
}

/// Inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// Snap a timestamp into the range.
    pub fn clamp(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        if t < self.start {
            self.start
        } else if t > self.end {
            self.end
        } else {
            t
        }
    }
}

/// Snapshot of the simulation clock, serialized into `sim:state` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationState {
    pub time: String,
    pub speed: f64,
    pub running: bool,
}

/// ISO-8601 UTC with seconds precision, the timestamp format of every
/// outbound event.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    #[test]
    fn test_sensor_type_wire_names() {
        assert_eq!(SensorType::GridPower.to_string(), "grid_power");
        assert_eq!(
            SensorType::PumpZ1TargetTemp.to_string(),
            "pump_z1_target_temp"
        );
        assert_eq!(
            SensorType::from_str("pump_ext_temp").unwrap(),
            SensorType::PumpExtTemp
        );
    }

    #[test]
    fn test_diagnostic_classification() {
        assert!(SensorType::PumpCop.is_hp_diagnostic());
        assert!(SensorType::GridVoltage.is_power_quality());
        assert!(!SensorType::GridPower.is_hp_diagnostic());
        assert!(!SensorType::PumpFlow.is_power_quality());
    }

    #[test]
    fn test_time_range_clamp() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        );
        let before = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
        let inside = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        assert_eq!(range.clamp(before), range.start);
        assert_eq!(range.clamp(inside), inside);
        assert!(range.contains(range.start));
        assert!(!range.contains(range.end));
    }

    #[test]
    fn test_timestamp_format_has_seconds_precision() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 5).unwrap();
        assert_eq!(format_timestamp(t), "2024-03-01T08:30:05Z");
    }
}
