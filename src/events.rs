//! Outbound event envelopes and the observer boundary.
//!
//! Every event serializes as `{"type": "...", "payload": {...}}` with the
//! wire names the dashboard protocol expects. The engine never knows what
//! transport sits behind [`EventSink`]; callbacks must not block for long
//! and must never call back into the engine.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::battery::BatterySummary;
use crate::domain::SimulationState;
use crate::engine::arbitrage::ArbitrageDayRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingEvent {
    pub sensor_id: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryUpdateEvent {
    pub battery_power_w: f64,
    pub adjusted_grid_w: f64,
    pub soc_percent: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionComparisonEvent {
    pub timestamp: String,
    pub actual_power_w: f64,
    pub predicted_power_w: f64,
    pub actual_temp_c: Option<f64>,
    pub predicted_temp_c: Option<f64>,
    pub has_actual_temp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatingMonthReport {
    /// `YYYY-MM`.
    pub month: String,
    pub consumption_kwh: f64,
    pub production_kwh: f64,
    /// Production over consumption for the bucket; 0 when nothing consumed.
    pub cop: f64,
    pub cost_pln: f64,
    pub avg_temp_c: f64,
    pub temp_readings: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyDayReport {
    /// `YYYY-MM-DD`.
    pub date: String,
    pub actual_kwh: f64,
    pub predicted_kwh: f64,
    pub deviation_pct: f64,
    pub avg_temp_c: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadShiftSlot {
    pub kwh: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadShiftStats {
    /// Weekday (Monday = 0) x hour-of-day heat-pump energy and price.
    pub heatmap: Vec<Vec<LoadShiftSlot>>,
    pub avg_hp_price: f64,
    pub overall_avg_price: f64,
    pub shift_current_pln: f64,
    pub shift_optimal_pln: f64,
    pub shift_savings_pln: f64,
    pub shift_window_h: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HpDiagnostics {
    pub cop: f64,
    pub compressor_speed_rpm: f64,
    pub fan_speed_rpm: f64,
    pub discharge_temp_c: f64,
    pub high_pressure: f64,
    pub pump_flow_lmin: f64,
    pub inlet_temp_c: f64,
    pub outlet_temp_c: f64,
    pub dhw_temp_c: f64,
    pub outside_pipe_temp_c: f64,
    pub inside_pipe_temp_c: f64,
    pub z1_target_temp_c: f64,
    /// `flow [L/min] x dT [°C] x 69.77`, only while dT > 0 and flow > 0.
    pub thermal_power_w: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PowerQuality {
    pub voltage_v: f64,
    pub power_factor_pct: f64,
    pub reactive_power_var: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvArrayEnergy {
    pub name: String,
    pub energy_kwh: f64,
}

/// Everything the dashboard's summary pane renders, snapshotted from the
/// accumulators under the engine lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total_kwh: f64,
    pub today_kwh: f64,
    pub month_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub raw_import_kwh: f64,
    pub raw_export_kwh: f64,
    pub pv_production_kwh: f64,
    pub hp_consumption_kwh: f64,
    pub hp_production_kwh: f64,
    pub home_demand_kwh: f64,
    pub self_consumption_kwh: f64,
    pub battery_savings_kwh: f64,
    pub off_grid_coverage_pct: f64,
    pub import_cost_pln: f64,
    pub export_revenue_pln: f64,
    pub raw_import_cost_pln: f64,
    pub raw_export_revenue_pln: f64,
    pub arb_import_cost_pln: f64,
    pub arb_export_revenue_pln: f64,
    pub nm_import_cost_pln: f64,
    pub nm_credit_kwh: f64,
    pub nb_deposit_pln: f64,
    pub nb_charged_pln: f64,
    pub cheap_export_kwh: f64,
    pub cheap_export_events: u64,
    pub hp_cost_pln: f64,
    pub preheat_cost_pln: f64,
    pub shadow_indoor_temp_c: f64,
    pub current_price_pln_kwh: f64,
    pub battery_soc_percent: Option<f64>,
    pub pv_arrays: Vec<PvArrayEnergy>,
}

impl Summary {
    /// Share of (weighted) home demand covered without the grid.
    ///
    /// `hp_pct` weighs how much of the heat-pump load counts as demand,
    /// `battery_pct` how much of the battery savings does; both default to
    /// 100 in the broadcast value. Capped at 100, and 100 outright when the
    /// weighted demand vanishes.
    pub fn off_grid_coverage(&self, hp_pct: f64, battery_pct: f64) -> f64 {
        let weighted_demand = self.home_demand_kwh
            - self.hp_consumption_kwh * (1.0 - hp_pct / 100.0)
            - self.battery_savings_kwh * (1.0 - battery_pct / 100.0);
        if weighted_demand <= 0.0 {
            return 100.0;
        }
        let covered = self.self_consumption_kwh + self.battery_savings_kwh;
        (100.0 * covered / weighted_demand).min(100.0)
    }
}

/// Tagged envelopes pushed to every connected observer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "sim:state")]
    SimState(SimulationState),
    #[serde(rename = "sensor:reading")]
    SensorReading(ReadingEvent),
    #[serde(rename = "summary:update")]
    SummaryUpdate(Summary),
    #[serde(rename = "battery:update")]
    BatteryUpdate(BatteryUpdateEvent),
    #[serde(rename = "battery:summary")]
    BatterySummary(BatterySummary),
    #[serde(rename = "arbitrage:day_log")]
    ArbitrageDayLog(Vec<ArbitrageDayRecord>),
    #[serde(rename = "prediction:comparison")]
    PredictionComparison(PredictionComparisonEvent),
    #[serde(rename = "heating:stats")]
    HeatingStats(Vec<HeatingMonthReport>),
    #[serde(rename = "anomaly:days")]
    AnomalyDays(Vec<AnomalyDayReport>),
    #[serde(rename = "load_shift:stats")]
    LoadShiftStats(LoadShiftStats),
    #[serde(rename = "hp:diagnostics")]
    HpDiagnostics(HpDiagnostics),
    #[serde(rename = "power_quality")]
    PowerQuality(PowerQuality),
}

/// Observer boundary. Implementations fan events out to whatever transport
/// the embedder runs; they are called outside the engine lock and must not
/// re-enter the engine.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}

/// Sink that keeps everything in memory. Used by tests and by embedders
/// that want to poll instead of push.
#[derive(Default)]
pub struct BufferingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl BufferingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for BufferingSink {
    fn on_event(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}
