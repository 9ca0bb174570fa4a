pub mod types;

pub use types::{format_timestamp, Reading, Sensor, SensorType, SimulationState, TimeRange};
