//! End-to-end scenarios driven through `Engine::step`, observing only the
//! event stream an embedder would see.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use home_energy_replay::events::{BatteryUpdateEvent, EventSink};
use home_energy_replay::provider::{GridPowerModel, TemperatureModel};
use home_energy_replay::{
    BatteryConfig, BufferingSink, Engine, EngineEvent, PredictionProvider, ProviderConfig,
    Reading, Sensor, SensorStore, SensorType, Settings, Summary, TimeRange,
};

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 21, 0, 0, 0).unwrap()
}

fn sensor(id: &str, sensor_type: SensorType, unit: &str) -> Sensor {
    Sensor {
        id: id.to_string(),
        name: id.to_string(),
        sensor_type,
        unit: unit.to_string(),
    }
}

fn reading(id: &str, sensor_type: SensorType, t: DateTime<Utc>, value: f64) -> Reading {
    Reading {
        timestamp: t,
        sensor_id: id.to_string(),
        sensor_type,
        value,
        unit: "W".to_string(),
    }
}

/// Store with one grid sensor and hourly readings from `start_time()`.
fn grid_store(values: &[f64]) -> Arc<SensorStore> {
    let store = Arc::new(SensorStore::new());
    store.add_sensor(sensor("grid", SensorType::GridPower, "W"));
    let batch = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            reading(
                "grid",
                SensorType::GridPower,
                start_time() + Duration::hours(i as i64),
                *v,
            )
        })
        .collect();
    store.add_readings("grid", batch).unwrap();
    store
}

fn add_hourly_prices(store: &SensorStore, hours: usize, price_of_hour: impl Fn(usize) -> f64) {
    store.add_sensor(sensor("price", SensorType::EnergyPrice, "PLN/kWh"));
    let batch = (0..hours)
        .map(|i| {
            reading(
                "price",
                SensorType::EnergyPrice,
                start_time() + Duration::hours(i as i64),
                price_of_hour(i % 24),
            )
        })
        .collect();
    store.add_readings("price", batch).unwrap();
}

fn engine_with(store: Arc<SensorStore>) -> (Engine, Arc<BufferingSink>) {
    let sink = Arc::new(BufferingSink::new());
    let dyn_sink: Arc<dyn EventSink> = sink.clone();
    let engine = Engine::new(store, dyn_sink, Settings::default()).expect("engine");
    (engine, sink)
}

fn test_battery() -> BatteryConfig {
    BatteryConfig {
        capacity_kwh: 10.0,
        max_power_w: 5000.0,
        discharge_floor_pct: 10.0,
        charge_ceiling_pct: 100.0,
        cycles_to_80_pct: 0.0,
    }
}

fn last_summary(events: &[EngineEvent]) -> Summary {
    events
        .iter()
        .rev()
        .find_map(|e| match e {
            EngineEvent::SummaryUpdate(s) => Some(s.clone()),
            _ => None,
        })
        .expect("a summary event")
}

fn battery_updates(events: &[EngineEvent]) -> Vec<BatteryUpdateEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::BatteryUpdate(u) => Some(u.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn flat_import_without_battery_totals_two_kwh() {
    let store = grid_store(&[1000.0, 1000.0, 1000.0]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());

    engine.step(Duration::hours(2));
    let events = sink.drain();
    let summary = last_summary(&events);
    assert!((summary.total_kwh - 2.0).abs() < 1e-9);
    assert!((summary.grid_import_kwh - 2.0).abs() < 1e-9);
    assert_eq!(summary.grid_export_kwh, 0.0);
    assert_eq!(summary.battery_soc_percent, None);
}

#[test]
fn export_then_import_with_battery() {
    let store = grid_store(&[-2000.0, -2000.0, -2000.0, 1000.0, 1000.0, 1000.0, 1000.0]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_battery(Some(test_battery())).unwrap();
    sink.drain();

    engine.step(Duration::hours(7));
    let events = sink.drain();
    let updates = battery_updates(&events);
    assert_eq!(updates.len(), 7);

    assert_eq!(updates[0].battery_power_w, 0.0);
    for update in &updates[1..4] {
        assert_eq!(update.battery_power_w, -2000.0);
    }
    assert!((updates[3].soc_percent - 60.0).abs() < 0.001);
    assert_eq!(updates[4].battery_power_w, 1000.0);
    assert!((updates[6].soc_percent - 30.0).abs() < 0.001);

    // flow identity on every update
    for (update, raw) in updates
        .iter()
        .zip([-2000.0, -2000.0, -2000.0, 1000.0, 1000.0, 1000.0, 1000.0])
    {
        assert!((update.adjusted_grid_w - (raw - update.battery_power_w)).abs() < 1e-9);
    }
}

#[test]
fn arbitrage_day_earns_against_raw_baseline() {
    let store = grid_store(&[1000.0; 48]);
    add_hourly_prices(&store, 48, |hour| if hour < 8 { 0.20 } else { 0.80 });
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_battery(Some(test_battery())).unwrap();
    engine.set_price_sensor(Some("price".to_string()));
    sink.drain();

    engine.step(Duration::hours(49));
    let events = sink.drain();
    let log = events
        .iter()
        .rev()
        .find_map(|e| match e {
            EngineEvent::ArbitrageDayLog(log) => Some(log.clone()),
            _ => None,
        })
        .expect("an arbitrage day log");

    let record = log
        .iter()
        .find(|r| r.date == "2024-05-21")
        .expect("a record for the first day");
    assert!(record.charge_start_time.is_some());
    assert!(record.discharge_start_time.is_some());
    assert!(record.cycles_delta > 0.0);
    assert!(record.earnings_pln > 0.0);
    assert!(record.arbitrage_cost_pln < record.raw_cost_pln);
}

#[test]
fn arbitrage_windows_never_overlap() {
    let price_of_hour = |hour: usize| match hour {
        0..=5 => 0.10,
        6..=7 => 0.40,
        8..=15 => 0.90,
        16..=19 => 0.40,
        _ => 0.10,
    };
    let store = grid_store(&[1000.0; 48]);
    add_hourly_prices(&store, 48, price_of_hour);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_battery(Some(test_battery())).unwrap();
    engine.set_price_sensor(Some("price".to_string()));
    sink.drain();

    engine.step(Duration::hours(49));
    let events = sink.drain();
    let log = events
        .iter()
        .rev()
        .find_map(|e| match e {
            EngineEvent::ArbitrageDayLog(log) => Some(log.clone()),
            _ => None,
        })
        .expect("an arbitrage day log");
    let record = log
        .iter()
        .find(|r| r.date == "2024-05-21")
        .expect("a record for the first day");

    let charge_end = record.charge_end_time.clone().expect("charge window");
    let discharge_start = record
        .discharge_start_time
        .clone()
        .expect("discharge window");
    assert!(charge_end < discharge_start);
    assert!(record.gap_minutes > 0);
    // late-night cheap hours must not reopen the charge window
    assert!(charge_end.as_str() < "06:00");
}

#[test]
fn seek_resets_energy_and_battery() {
    let store = grid_store(&[1000.0, 1000.0, 1000.0]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_battery(Some(test_battery())).unwrap();

    engine.step(Duration::hours(2));
    let before = last_summary(&sink.drain());
    assert!(before.total_kwh > 0.0);

    engine.seek(start_time());
    let events = sink.drain();
    let summary = last_summary(&events);
    assert_eq!(summary.total_kwh, 0.0);
    assert_eq!(summary.grid_import_kwh, 0.0);
    assert_eq!(summary.battery_soc_percent, Some(10.0));

    // and the replay is deterministic after the rewind
    engine.step(Duration::hours(2));
    let replayed = last_summary(&sink.drain());
    assert!((replayed.total_kwh - before.total_kwh).abs() < 1e-9);
}

#[test]
fn set_time_range_rewinds_to_new_start() {
    let store = grid_store(&[1000.0; 10]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.step(Duration::hours(5));
    sink.drain();

    let range = TimeRange::new(start_time(), start_time() + Duration::hours(4));
    engine.set_time_range(range);
    let summary = last_summary(&sink.drain());
    assert_eq!(summary.total_kwh, 0.0);

    engine.step(Duration::hours(10));
    let summary = last_summary(&sink.drain());
    // clamped at the new 4 h bound
    assert!((summary.total_kwh - 4.0).abs() < 1e-9);
    assert!(!engine.simulation_state().running);
}

#[test]
fn day_rollover_restarts_today_counter() {
    let store = grid_store(&[1000.0; 30]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());

    engine.step(Duration::hours(30));
    let summary = last_summary(&sink.drain());
    assert!((summary.total_kwh - 29.0).abs() < 1e-9);
    // six intervals end on the second calendar day (00:00 through 05:00)
    assert!((summary.today_kwh - 6.0).abs() < 1e-9);
}

#[test]
fn net_metering_and_billing_ledgers() {
    let store = grid_store(&[-2000.0, -2000.0, 2000.0, 2000.0]);
    add_hourly_prices(&store, 4, |_| 0.5);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_price_sensor(Some("price".to_string()));
    sink.drain();

    engine.step(Duration::hours(3));
    let summary = last_summary(&sink.drain());

    // net metering: 2 kWh exported -> 1.6 kWh credited; 2 kWh imported
    // drains the bank and pays spot for the uncovered 0.4 kWh
    assert!((summary.nm_import_cost_pln - (1.6 * 0.3 + 0.4 * 0.5)).abs() < 1e-9);
    assert!(summary.nm_credit_kwh.abs() < 1e-9);

    // net billing: 2 kWh at RCEm 0.5 deposited, 2 kWh at the fixed tariff
    // drawn against it
    assert!(summary.nb_deposit_pln.abs() < 1e-9);
    assert!((summary.nb_charged_pln - 1.0).abs() < 1e-9);

    // raw and adjusted pipelines agree without a battery
    assert!((summary.raw_import_kwh - summary.grid_import_kwh).abs() < 1e-9);
}

#[test]
fn heating_months_and_load_shift_reports() {
    let store = Arc::new(SensorStore::new());
    store.add_sensor(sensor("ext", SensorType::PumpExtTemp, "°C"));
    store.add_sensor(sensor("hp", SensorType::PumpConsumption, "W"));
    store.add_sensor(sensor("hpprod", SensorType::PumpProduction, "W"));
    let mut ext = Vec::new();
    let mut hp = Vec::new();
    let mut prod = Vec::new();
    for i in 0..4i64 {
        let t = start_time() + Duration::hours(i);
        ext.push(reading("ext", SensorType::PumpExtTemp, t, -5.0));
        hp.push(reading("hp", SensorType::PumpConsumption, t, 2000.0));
        prod.push(reading("hpprod", SensorType::PumpProduction, t, 6000.0));
    }
    store.add_readings("ext", ext).unwrap();
    store.add_readings("hp", hp).unwrap();
    store.add_readings("hpprod", prod).unwrap();
    add_hourly_prices(&store, 4, |_| 0.5);

    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_price_sensor(Some("price".to_string()));
    sink.drain();

    engine.step(Duration::hours(3));
    let events = sink.drain();

    let heating = events
        .iter()
        .rev()
        .find_map(|e| match e {
            EngineEvent::HeatingStats(months) => Some(months.clone()),
            _ => None,
        })
        .expect("heating stats");
    assert_eq!(heating.len(), 1);
    let month = &heating[0];
    assert_eq!(month.month, "2024-05");
    assert!((month.consumption_kwh - 6.0).abs() < 1e-9);
    assert!((month.production_kwh - 18.0).abs() < 1e-9);
    assert!((month.cop - 3.0).abs() < 1e-9);
    assert!((month.avg_temp_c - -5.0).abs() < 1e-9);
    assert_eq!(month.temp_readings, 4);

    let shift = events
        .iter()
        .rev()
        .find_map(|e| match e {
            EngineEvent::LoadShiftStats(s) => Some(s.clone()),
            _ => None,
        })
        .expect("load shift stats");
    assert!((shift.shift_current_pln - 3.0).abs() < 1e-9);
    assert_eq!(shift.heatmap.len(), 7);

    let summary = last_summary(&events);
    assert!((summary.hp_consumption_kwh - 6.0).abs() < 1e-9);
    assert!((summary.hp_cost_pln - 3.0).abs() < 1e-9);
    // flat prices give degenerate thresholds: the shadow schedule tracks
    // the observed pump and bills the same energy
    assert!((summary.preheat_cost_pln - 3.0).abs() < 1e-9);
}

#[test]
fn hp_diagnostics_compute_thermal_power() {
    let store = Arc::new(SensorStore::new());
    store.add_sensor(sensor("flow", SensorType::PumpFlow, "L/min"));
    store.add_sensor(sensor("inlet", SensorType::PumpInletTemp, "°C"));
    store.add_sensor(sensor("outlet", SensorType::PumpOutletTemp, "°C"));
    let t = start_time();
    store
        .add_readings("flow", vec![reading("flow", SensorType::PumpFlow, t, 20.0)])
        .unwrap();
    store
        .add_readings(
            "inlet",
            vec![reading("inlet", SensorType::PumpInletTemp, t, 30.0)],
        )
        .unwrap();
    store
        .add_readings(
            "outlet",
            vec![reading("outlet", SensorType::PumpOutletTemp, t, 35.0)],
        )
        .unwrap();

    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    sink.drain();

    engine.step(Duration::hours(1));
    let events = sink.drain();
    let diag = events
        .iter()
        .rev()
        .find_map(|e| match e {
            EngineEvent::HpDiagnostics(d) => Some(*d),
            _ => None,
        })
        .expect("hp diagnostics");
    assert!((diag.pump_flow_lmin - 20.0).abs() < 1e-9);
    assert!((diag.thermal_power_w - 20.0 * 5.0 * 69.77).abs() < 1e-6);
}

struct FlatTemp(f64);
impl TemperatureModel for FlatTemp {
    fn predict_temp_c(&self, _t: DateTime<Utc>, anomaly_offset_c: f64) -> f64 {
        self.0 + anomaly_offset_c
    }
}

struct ConstGrid(f64);
impl GridPowerModel for ConstGrid {
    fn predict_power_w(&self, _t: DateTime<Utc>, _outdoor_temp_c: f64) -> f64 {
        self.0
    }
}

fn stub_provider(power_w: f64) -> PredictionProvider {
    let config = ProviderConfig {
        noise_sigma_c: 0.0,
        ..ProviderConfig::default()
    };
    PredictionProvider::new(Box::new(FlatTemp(5.0)), Box::new(ConstGrid(power_w)), config)
}

#[test]
fn prediction_mode_emits_synthetic_stream() {
    let store = Arc::new(SensorStore::new());
    let (engine, sink) = engine_with(store);
    engine.set_provider(stub_provider(800.0));

    engine.set_prediction_mode(true);
    sink.drain();
    engine.step(Duration::hours(2));
    let events = sink.drain();

    let synthetic: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::SensorReading(r) if r.sensor_id == "predicted_grid" => Some(r.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(synthetic.len(), 2);
    assert!(synthetic.iter().all(|r| (r.value - 800.0).abs() < 1e-9));

    // one hour between the two synthetic samples lands in the totals
    let summary = last_summary(&events);
    assert!((summary.total_kwh - 0.8).abs() < 1e-9);
}

#[test]
fn prediction_mode_without_provider_is_silent() {
    let store = grid_store(&[1000.0, 1000.0]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_prediction_mode(true);
    sink.drain();

    engine.step(Duration::hours(2));
    let events = sink.drain();
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::SensorReading(_))));
}

#[test]
fn comparison_mode_tracks_anomaly_days() {
    let store = grid_store(&[1000.0; 49]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_provider(stub_provider(800.0));
    sink.drain();

    engine.step(Duration::hours(49));
    let events = sink.drain();

    let comparisons = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::PredictionComparison(_)))
        .count();
    assert_eq!(comparisons, 49);

    let days = events
        .iter()
        .rev()
        .find_map(|e| match e {
            EngineEvent::AnomalyDays(days) => Some(days.clone()),
            _ => None,
        })
        .expect("anomaly days");
    let day = days
        .iter()
        .find(|d| d.date == "2024-05-21")
        .expect("first day report");
    assert!((day.actual_kwh - 23.0).abs() < 1e-9);
    assert!((day.predicted_kwh - 18.4).abs() < 1e-9);
    assert!((day.deviation_pct - 25.0).abs() < 1e-6);
}

#[test]
fn init_fails_on_empty_store() {
    let store = Arc::new(SensorStore::new());
    let (engine, _sink) = engine_with(store);
    assert!(!engine.init());
}

#[test]
fn events_follow_readings_within_a_tick() {
    let store = grid_store(&[1000.0, 1000.0]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    sink.drain();

    engine.step(Duration::hours(1));
    let events = sink.drain();
    let first_reading = events
        .iter()
        .position(|e| matches!(e, EngineEvent::SensorReading(_)))
        .expect("readings");
    let state = events
        .iter()
        .position(|e| matches!(e, EngineEvent::SimState(_)))
        .expect("state");
    let summary = events
        .iter()
        .position(|e| matches!(e, EngineEvent::SummaryUpdate(_)))
        .expect("summary");
    assert!(first_reading < state);
    assert!(state < summary);
}

#[tokio::test(start_paused = true)]
async fn ticker_runs_to_the_end_of_the_range() {
    let store = grid_store(&[1000.0, 1000.0, 1000.0]);
    let (engine, sink) = engine_with(store);
    assert!(engine.init());
    engine.set_speed(3600.0); // one simulated hour per wall second
    engine.start();
    assert!(engine.simulation_state().running);

    // two simulated hours at 3600x is two wall seconds of ticking
    for _ in 0..60 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if !engine.simulation_state().running {
            break;
        }
    }
    assert!(!engine.simulation_state().running);
    let summary = last_summary(&sink.drain());
    assert!((summary.total_kwh - 2.0).abs() < 1e-9);

    // pause after the end stays a no-op
    engine.pause();
    assert!(!engine.simulation_state().running);
}

#[tokio::test(start_paused = true)]
async fn pause_stops_the_ticker() {
    let store = grid_store(&[1000.0; 1000]);
    let (engine, _sink) = engine_with(store);
    assert!(engine.init());
    engine.set_speed(60.0);
    engine.start();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    engine.pause();
    assert!(!engine.simulation_state().running);

    let frozen = engine.simulation_state().time.clone();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert_eq!(engine.simulation_state().time, frozen);
}
