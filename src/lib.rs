//! Home-energy replay engine.
//!
//! Replays historical home-energy sensor data as a time-accelerated event
//! stream and computes derived quantities on the fly: per-source energy
//! totals, cost under several tariff regimes, battery behavior under two
//! control strategies, a shadow pre-heating model, arbitrage day ledgers,
//! and anomaly detection against predicted baselines.
//!
//! The embedder ingests readings into a [`store::SensorStore`], implements
//! [`events::EventSink`] for its transport, optionally plugs prediction
//! models into a [`provider::PredictionProvider`], and drives the
//! [`engine::Engine`] through its control API.

pub mod battery;
pub mod config;
pub mod domain;
pub mod engine;
pub mod events;
pub mod provider;
pub mod store;
pub mod telemetry;
pub mod thermal;

pub use battery::{Battery, BatteryConfig, BatterySummary};
pub use config::Settings;
pub use domain::{Reading, Sensor, SensorType, SimulationState, TimeRange};
pub use engine::arbitrage::ArbitrageDayRecord;
pub use engine::pv::PvArrayConfig;
pub use engine::Engine;
pub use events::{BufferingSink, EngineEvent, EventSink, Summary};
pub use provider::{GridPowerModel, PredictionProvider, ProviderConfig, TemperatureModel};
pub use store::SensorStore;
pub use thermal::{InsulationLevel, ThermalConfig, ThermalModel};
