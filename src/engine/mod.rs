//! The replay engine: owns simulated time, the batteries, the thermal
//! shadow, every period accumulator, and the ticker that drives them.
//!
//! All mutable state sits behind one mutex. Each operation mutates under
//! the lock, collects the events it produced into a local buffer, then
//! publishes after release so a slow sink can never wedge the engine.

pub mod arbitrage;
mod emit;
mod energy;
pub mod pv;
mod reports;
mod tariffs;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::battery::{Battery, BatteryConfig};
use crate::config::Settings;
use crate::domain::{format_timestamp, Reading, SimulationState, TimeRange};
use crate::events::{EngineEvent, EventSink, HpDiagnostics, PowerQuality, Summary};
use crate::provider::PredictionProvider;
use crate::store::SensorStore;
use crate::thermal::{InsulationLevel, ThermalModel};

use arbitrage::ArbitrageTracker;
use energy::{start_of_day, start_of_month, AnomalyTracker, CostTotals, EnergyTotals, HeatingMonths, LoadShift};
use pv::CustomPv;
use tariffs::{NetBilling, NetMeteringBank};

/// Floor of one tenth of a wall-second, ceiling of roughly a month of
/// simulated time per wall-second.
pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 2_592_000.0;

/// Everything that Seek / SetTimeRange / mode switches clear together.
#[derive(Default)]
pub(crate) struct Accumulators {
    /// Previous reading per `sensor_id + pipeline suffix`.
    pub(crate) last_readings: HashMap<String, Reading>,
    pub(crate) energy: EnergyTotals,
    pub(crate) cost: CostTotals,
    pub(crate) day_marker: Option<DateTime<Utc>>,
    pub(crate) month_marker: Option<DateTime<Utc>>,
    pub(crate) nm: NetMeteringBank,
    pub(crate) nb: NetBilling,
    pub(crate) price_day_cache: HashMap<String, (f64, f64)>,
    pub(crate) rcem_cache: HashMap<String, f64>,
    pub(crate) arb: ArbitrageTracker,
    pub(crate) heating: HeatingMonths,
    pub(crate) load_shift: LoadShift,
    pub(crate) anomaly: AnomalyTracker,
    pub(crate) hp_diag: HpDiagnostics,
    pub(crate) hp_diag_dirty: bool,
    pub(crate) power_quality: PowerQuality,
    pub(crate) pq_dirty: bool,
    pub(crate) latest_ext_temp: Option<f64>,
    pub(crate) latest_cop: Option<f64>,
}

pub(crate) struct Inner {
    pub(crate) settings: Settings,
    pub(crate) time_range: Option<TimeRange>,
    /// Historical bounds parked while prediction mode is active.
    pub(crate) saved_range: Option<TimeRange>,
    pub(crate) sim_time: DateTime<Utc>,
    pub(crate) speed: f64,
    pub(crate) running: bool,
    pub(crate) prediction_mode: bool,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) battery: Option<Battery>,
    pub(crate) alt_battery: Option<Battery>,
    pub(crate) thermal: ThermalModel,
    pub(crate) provider: Option<PredictionProvider>,
    pub(crate) price_sensor: Option<String>,
    pub(crate) temp_sensor: Option<String>,
    pub(crate) export_coefficient: f64,
    pub(crate) cheap_price_threshold: f64,
    pub(crate) fixed_tariff: f64,
    pub(crate) distribution_fee: f64,
    pub(crate) net_metering_ratio: f64,
    pub(crate) custom_pv: Option<CustomPv>,
    pub(crate) acc: Accumulators,
}

impl Inner {
    pub(crate) fn sim_state(&self) -> SimulationState {
        SimulationState {
            time: format_timestamp(self.sim_time),
            speed: self.speed,
            running: self.running,
        }
    }

    pub(crate) fn prime_markers(&mut self) {
        self.acc.day_marker = Some(start_of_day(self.sim_time));
        self.acc.month_marker = Some(start_of_month(self.sim_time));
    }

    /// Clear every accumulator and both batteries; dirty-flag the heavy
    /// reports so connected dashboards drop their stale copies.
    pub(crate) fn reset_all(&mut self) {
        self.acc = Accumulators::default();
        self.acc.arb.reset();
        self.acc.anomaly.dirty = true;
        self.acc.load_shift.dirty = true;
        self.acc.hp_diag_dirty = true;
        self.acc.pq_dirty = true;
        self.prime_markers();
        if let Some(battery) = self.battery.as_mut() {
            battery.reset();
        }
        if let Some(battery) = self.alt_battery.as_mut() {
            battery.reset();
        }
        self.thermal.reset();
        if let Some(pv) = self.custom_pv.as_mut() {
            pv.reset_counters();
        }
    }

    /// Advance simulated time by `delta` and run the emit-and-broadcast
    /// sequence. Returns true when the end of the range was reached.
    pub(crate) fn advance(
        &mut self,
        store: &SensorStore,
        delta: Duration,
        events: &mut Vec<EngineEvent>,
    ) -> bool {
        let prev = self.sim_time;
        let mut now = prev + delta;
        let mut ended = false;
        if !self.prediction_mode {
            if let Some(range) = self.time_range {
                if now >= range.end {
                    now = range.end;
                    ended = true;
                }
            }
        }
        self.sim_time = now;
        self.emit_readings(store, prev, now, events);
        events.push(EngineEvent::SimState(self.sim_state()));
        self.push_reports(store, events);
        if ended && self.running {
            self.running = false;
            if let Some(token) = self.cancel.take() {
                token.cancel();
            }
            events.push(EngineEvent::SimState(self.sim_state()));
        }
        ended
    }
}

/// Handle to one logical simulation; cheap to clone, shared with the
/// ticker task and the transport layer.
#[derive(Clone)]
pub struct Engine {
    store: Arc<SensorStore>,
    sink: Arc<dyn EventSink>,
    inner: Arc<Mutex<Inner>>,
}

impl Engine {
    pub fn new(
        store: Arc<SensorStore>,
        sink: Arc<dyn EventSink>,
        settings: Settings,
    ) -> Result<Self> {
        let (battery, alt_battery) = match settings.battery {
            Some(cfg) => (Some(Battery::new(cfg)?), Some(Battery::new(cfg)?)),
            None => (None, None),
        };
        let inner = Inner {
            speed: settings.engine.default_speed.clamp(MIN_SPEED, MAX_SPEED),
            thermal: ThermalModel::new(settings.thermal),
            time_range: None,
            saved_range: None,
            sim_time: Utc::now(),
            running: false,
            prediction_mode: false,
            cancel: None,
            battery,
            alt_battery,
            provider: None,
            price_sensor: None,
            temp_sensor: None,
            export_coefficient: settings.tariffs.export_coefficient,
            cheap_price_threshold: settings.tariffs.cheap_price_threshold,
            fixed_tariff: settings.tariffs.fixed_tariff,
            distribution_fee: settings.tariffs.distribution_fee,
            net_metering_ratio: settings.tariffs.net_metering_ratio,
            custom_pv: None,
            acc: Accumulators::default(),
            settings,
        };
        Ok(Self {
            store,
            sink,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    fn publish(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.sink.on_event(event);
        }
    }

    /// Bind to the store's global range. False (and no state change) when
    /// the store holds no data.
    pub fn init(&self) -> bool {
        let mut inner = self.inner.lock();
        let Some(range) = self.store.global_time_range() else {
            warn!("init refused: store has no readings");
            return false;
        };
        inner.time_range = Some(range);
        inner.sim_time = range.start;
        inner.prime_markers();
        info!(
            start = %format_timestamp(range.start),
            end = %format_timestamp(range.end),
            "engine bound to store range"
        );
        true
    }

    /// Spawn the ticker. Idempotent; a second call only re-broadcasts
    /// state. Must run inside a tokio runtime.
    pub fn start(&self) {
        let token = {
            let mut inner = self.inner.lock();
            if inner.running {
                let state = inner.sim_state();
                drop(inner);
                self.publish(vec![EngineEvent::SimState(state)]);
                return;
            }
            inner.running = true;
            let token = CancellationToken::new();
            inner.cancel = Some(token.clone());
            info!(speed = inner.speed, "simulation started");
            token
        };
        self.publish(vec![EngineEvent::SimState(self.simulation_state())]);

        let engine = self.clone();
        let tick_ms = self.inner.lock().settings.engine.tick_interval_ms;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(tick_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if engine.run_tick() {
                    break;
                }
            }
            debug!("ticker stopped");
        });
    }

    /// Stop the ticker. Idempotent.
    pub fn pause(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.running {
                inner.running = false;
                if let Some(token) = inner.cancel.take() {
                    token.cancel();
                }
                info!("simulation paused");
            }
            events.push(EngineEvent::SimState(inner.sim_state()));
        }
        self.publish(events);
    }

    /// One ticker iteration. Returns true when the loop should exit.
    fn run_tick(&self) -> bool {
        let mut events = Vec::new();
        let ended = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return true;
            }
            let tick_ms = inner.settings.engine.tick_interval_ms;
            let sim_nanos = tick_ms as f64 * 1.0e6 * inner.speed;
            let delta = Duration::nanoseconds(sim_nanos as i64);
            inner.advance(&self.store, delta, &mut events)
        };
        self.publish(events);
        ended
    }

    /// Advance simulated time by an explicit delta, outside the ticker.
    /// Runs the exact same pipeline; the tool for deterministic tests.
    pub fn step(&self, delta: Duration) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.advance(&self.store, delta, &mut events);
        }
        self.publish(events);
    }

    pub fn set_speed(&self, speed: f64) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.speed = if speed.is_finite() {
                speed.clamp(MIN_SPEED, MAX_SPEED)
            } else {
                inner.speed
            };
            events.push(EngineEvent::SimState(inner.sim_state()));
        }
        self.publish(events);
    }

    /// Snap simulated time and clear every accumulator and both batteries.
    pub fn seek(&self, t: DateTime<Utc>) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let target = match inner.time_range {
                Some(range) => range.clamp(t),
                None => t,
            };
            inner.sim_time = target;
            inner.reset_all();
            debug!(to = %format_timestamp(target), "seek");
            events.push(EngineEvent::SimState(inner.sim_state()));
            inner.push_reports(&self.store, &mut events);
        }
        self.publish(events);
    }

    /// Replace the simulation bounds, then seek to the new start.
    pub fn set_time_range(&self, range: TimeRange) {
        {
            let mut inner = self.inner.lock();
            inner.time_range = Some(range);
        }
        self.seek(range.start);
    }

    /// Attach (or detach, with None) the primary battery and its arbitrage
    /// shadow. Invalid configurations fail loudly and change nothing.
    pub fn set_battery(&self, config: Option<BatteryConfig>) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            match config {
                Some(cfg) => {
                    inner.battery = Some(Battery::new(cfg)?);
                    inner.alt_battery = Some(Battery::new(cfg)?);
                    info!(capacity_kwh = cfg.capacity_kwh, "battery attached");
                }
                None => {
                    inner.battery = None;
                    inner.alt_battery = None;
                    info!("battery detached");
                }
            }
            inner.push_reports(&self.store, &mut events);
        }
        self.publish(events);
        Ok(())
    }

    /// Switch between historical replay and the synthetic provider stream.
    /// Both directions clear all accumulators.
    pub fn set_prediction_mode(&self, on: bool) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.prediction_mode == on {
                return;
            }
            if on {
                inner.saved_range = inner.time_range;
                inner.prediction_mode = true;
                let now = Utc::now();
                inner.sim_time = now;
                inner.time_range = Some(TimeRange::new(now, far_future()));
                inner.reset_all();
                if let Some(provider) = inner.provider.as_mut() {
                    provider.init(now);
                } else {
                    warn!("prediction mode without a provider: stream will be silent");
                }
            } else {
                inner.prediction_mode = false;
                inner.time_range = inner.saved_range.take();
                if let Some(range) = inner.time_range {
                    inner.sim_time = range.start;
                }
                inner.reset_all();
            }
            info!(prediction_mode = on, "mode switched");
            events.push(EngineEvent::SimState(inner.sim_state()));
            inner.push_reports(&self.store, &mut events);
        }
        self.publish(events);
    }

    pub fn set_provider(&self, provider: PredictionProvider) {
        self.inner.lock().provider = Some(provider);
    }

    pub fn set_price_sensor(&self, sensor_id: Option<String>) {
        let mut inner = self.inner.lock();
        inner.price_sensor = sensor_id;
        inner.acc.price_day_cache.clear();
        inner.acc.rcem_cache.clear();
    }

    pub fn set_temp_sensor(&self, sensor_id: Option<String>) {
        self.inner.lock().temp_sensor = sensor_id;
    }

    pub fn set_export_coefficient(&self, ratio: f64) {
        self.inner.lock().export_coefficient = ratio.clamp(0.0, 1.0);
    }

    pub fn set_cheap_price_threshold(&self, pln_per_kwh: f64) {
        self.inner.lock().cheap_price_threshold = pln_per_kwh;
    }

    pub fn set_fixed_tariff(&self, pln_per_kwh: f64) {
        self.inner.lock().fixed_tariff = pln_per_kwh.max(0.0);
    }

    pub fn set_distribution_fee(&self, pln_per_kwh: f64) {
        self.inner.lock().distribution_fee = pln_per_kwh.max(0.0);
    }

    pub fn set_net_metering_ratio(&self, ratio: f64) {
        self.inner.lock().net_metering_ratio = ratio.clamp(0.0, 1.0);
    }

    pub fn set_insulation_level(&self, level: InsulationLevel) {
        self.inner.lock().thermal.set_insulation(level);
    }

    /// Shift the provider's anomaly input (°C).
    pub fn set_temp_offset(&self, offset_c: f64) {
        if let Some(provider) = self.inner.lock().provider.as_mut() {
            provider.set_temp_offset(offset_c);
        }
    }

    /// Enable or disable the custom PV rewrite. Requires historical PV
    /// data to derive the base profile from; without it the rewrite stays
    /// off.
    pub fn set_pv_config(&self, enabled: bool, arrays: Vec<pv::PvArrayConfig>) {
        let mut inner = self.inner.lock();
        if !enabled || arrays.is_empty() {
            inner.custom_pv = None;
            return;
        }
        let Some(sensor) = self
            .store
            .sensors()
            .into_iter()
            .find(|s| s.sensor_type == crate::domain::SensorType::PvPower)
        else {
            warn!("custom PV requested but no PV sensor exists");
            inner.custom_pv = None;
            return;
        };
        let Some(range) = self.store.global_time_range() else {
            inner.custom_pv = None;
            return;
        };
        let history = self
            .store
            .readings_in_range(&sensor.id, range.start, range.end + Duration::nanoseconds(1));
        match pv::BaseProfile::from_history(&history) {
            Some(profile) => {
                info!(arrays = arrays.len(), "custom PV enabled");
                inner.custom_pv = Some(CustomPv::new(arrays, profile, sensor.id));
            }
            None => {
                warn!("custom PV requested but history holds no production");
                inner.custom_pv = None;
            }
        }
    }

    pub fn simulation_state(&self) -> SimulationState {
        self.inner.lock().sim_state()
    }

    /// Summary snapshot outside the broadcast path (poll-style embedders).
    pub fn current_summary(&self) -> Summary {
        self.inner.lock().build_summary(&self.store)
    }
}

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2200, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| Utc::now() + Duration::days(64_000))
}
