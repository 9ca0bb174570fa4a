//! Reading emission: pulls the interval just traversed from the store (or
//! the provider), runs every reading through the accumulator pipelines,
//! and queues the resulting events.

use chrono::{DateTime, Duration, Months, Utc};

use crate::domain::{format_timestamp, Reading, SensorType};
use crate::events::{
    BatteryUpdateEvent, EngineEvent, PredictionComparisonEvent, ReadingEvent,
};
use crate::store::SensorStore;

use super::energy::{
    integrate, month_key, start_of_day, start_of_month, SUFFIX_ARBITRAGE, SUFFIX_NET_BILLING,
    SUFFIX_NET_METERING, SUFFIX_PRIMARY, SUFFIX_RAW,
};
use super::Inner;

impl Inner {
    /// Pull and dispatch everything in (prev, now] worth of readings.
    /// `prev` itself is included on the very first interval after a seek
    /// because range queries are half-open on the right.
    pub(crate) fn emit_readings(
        &mut self,
        store: &SensorStore,
        prev: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
    ) {
        if now <= prev {
            return;
        }
        if self.prediction_mode {
            self.emit_predictions(store, prev, now, events);
            return;
        }
        // the final boundary reading sits exactly at range.end; nudge the
        // half-open query past it on the last interval
        let query_end = match self.time_range {
            Some(range) if now >= range.end => now + Duration::nanoseconds(1),
            _ => now,
        };
        for sensor in store.sensors() {
            for reading in store.readings_in_range(&sensor.id, prev, query_end) {
                self.dispatch_reading(store, reading, events);
            }
        }
    }

    /// Synthetic hourly grid stream from the provider; a no-op without one.
    fn emit_predictions(
        &mut self,
        store: &SensorStore,
        prev: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
    ) {
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        let readings = provider.readings_for_range(prev, now);
        for reading in readings {
            self.dispatch_reading(store, reading, events);
        }
    }

    fn dispatch_reading(
        &mut self,
        store: &SensorStore,
        mut reading: Reading,
        events: &mut Vec<EngineEvent>,
    ) {
        let t = reading.timestamp;

        // custom PV rewrites happen before anything downstream sees the value
        if let Some(custom_pv) = self.custom_pv.as_mut() {
            match reading.sensor_type {
                SensorType::PvPower if reading.sensor_id == custom_pv.pv_sensor_id => {
                    reading.value = custom_pv.rewrite_pv_value(t);
                }
                SensorType::GridPower => {
                    let historical_pv = store
                        .reading_at(&custom_pv.pv_sensor_id, t)
                        .map(|r| r.value)
                        .unwrap_or(0.0);
                    let new_pv = custom_pv.total_power_w(t);
                    reading.value += historical_pv - new_pv;
                }
                _ => {}
            }
        }

        events.push(EngineEvent::SensorReading(ReadingEvent {
            sensor_id: reading.sensor_id.clone(),
            value: reading.value,
            unit: reading.unit.clone(),
            timestamp: format_timestamp(t),
        }));

        self.capture_diagnostics(&reading);

        match reading.sensor_type {
            SensorType::PumpExtTemp => {
                let selected = self
                    .temp_sensor
                    .as_deref()
                    .map_or(true, |id| id == reading.sensor_id);
                if selected {
                    self.acc.latest_ext_temp = Some(reading.value);
                    self.acc.heating.add_temp(month_key(t), reading.value);
                    if self.acc.anomaly.is_day_open() {
                        self.acc.anomaly.add_temp(reading.value);
                    }
                }
            }
            SensorType::PumpCop => {
                self.acc.latest_cop = Some(reading.value);
            }
            SensorType::EnergyPrice => {
                self.acc.load_shift.observe_price(reading.value);
            }
            _ => {}
        }

        // parity comparison against the prediction chain, historical mode only
        if reading.sensor_type == SensorType::GridPower && !self.prediction_mode {
            let latest_temp = self.acc.latest_ext_temp;
            if let Some(provider) = self.provider.as_mut() {
                provider.ensure_initialized(t);
                if let Some(predicted) = provider.predicted_power_at(t) {
                    let predicted_temp = provider.predicted_temp_at(t);
                    events.push(EngineEvent::PredictionComparison(
                        PredictionComparisonEvent {
                            timestamp: format_timestamp(t),
                            actual_power_w: reading.value,
                            predicted_power_w: predicted,
                            actual_temp_c: latest_temp,
                            predicted_temp_c: predicted_temp,
                            has_actual_temp: latest_temp.is_some(),
                        },
                    ));
                    self.acc.anomaly.observe(t, reading.value, predicted);
                }
            }
        }

        if reading.sensor_type == SensorType::GridPower {
            // the counterfactual ledgers always see the unadjusted flow
            self.update_raw_pipelines(store, &reading);

            let battery_result = self
                .battery
                .as_mut()
                .map(|battery| battery.process(reading.value, t));
            if let Some(result) = battery_result {
                events.push(EngineEvent::BatteryUpdate(BatteryUpdateEvent {
                    battery_power_w: result.battery_power_w,
                    adjusted_grid_w: result.adjusted_grid_w,
                    soc_percent: result.soc_percent,
                    timestamp: format_timestamp(t),
                }));
                let adjusted = Reading {
                    value: result.adjusted_grid_w,
                    ..reading.clone()
                };
                self.update_primary(store, &adjusted);
                self.run_arbitrage_shadow(store, &reading);
            } else {
                self.update_primary(store, &reading);
            }
        } else {
            self.update_primary(store, &reading);
        }

        // shadow building follows the observed pump, priced at spot
        if reading.sensor_type == SensorType::PumpConsumption {
            if let Some(outdoor_c) = self.acc.latest_ext_temp {
                let (low, high) = self.day_thresholds(store, t);
                let price = self.price_at(store, t);
                let cop = self.acc.latest_cop.unwrap_or(0.0);
                self.thermal
                    .step(outdoor_c, price, low, high, reading.value, cop, t);
            }
        }
    }

    /// Latest diagnostic values for the `hp:diagnostics` / `power_quality`
    /// snapshots.
    fn capture_diagnostics(&mut self, reading: &Reading) {
        let value = reading.value;
        match reading.sensor_type {
            SensorType::GridVoltage => {
                self.acc.power_quality.voltage_v = value;
                self.acc.pq_dirty = true;
                return;
            }
            SensorType::GridPowerFactor => {
                self.acc.power_quality.power_factor_pct = value;
                self.acc.pq_dirty = true;
                return;
            }
            SensorType::GridPowerReactive => {
                self.acc.power_quality.reactive_power_var = value;
                self.acc.pq_dirty = true;
                return;
            }
            _ => {}
        }
        if !reading.sensor_type.is_hp_diagnostic() {
            return;
        }
        let diag = &mut self.acc.hp_diag;
        match reading.sensor_type {
            SensorType::PumpCop => diag.cop = value,
            SensorType::PumpCompressorSpeed => diag.compressor_speed_rpm = value,
            SensorType::PumpFanSpeed => diag.fan_speed_rpm = value,
            SensorType::PumpDischargeTemp => diag.discharge_temp_c = value,
            SensorType::PumpHighPressure => diag.high_pressure = value,
            SensorType::PumpFlow => diag.pump_flow_lmin = value,
            SensorType::PumpInletTemp => diag.inlet_temp_c = value,
            SensorType::PumpOutletTemp => diag.outlet_temp_c = value,
            SensorType::PumpDhwTemp => diag.dhw_temp_c = value,
            SensorType::PumpOutsidePipe => diag.outside_pipe_temp_c = value,
            SensorType::PumpInsidePipeTemp => diag.inside_pipe_temp_c = value,
            SensorType::PumpZ1TargetTemp => diag.z1_target_temp_c = value,
            _ => {}
        }
        let delta_t = diag.outlet_temp_c - diag.inlet_temp_c;
        diag.thermal_power_w = if delta_t > 0.0 && diag.pump_flow_lmin > 0.0 {
            diag.pump_flow_lmin * delta_t * 69.77
        } else {
            0.0
        };
        self.acc.hp_diag_dirty = true;
    }

    /// The three counterfactual grid ledgers: raw energy/cost, the
    /// net-metering bank, and the net-billing deposit.
    fn update_raw_pipelines(&mut self, store: &SensorStore, reading: &Reading) {
        let t = reading.timestamp;
        if let Some(wh) = integrate(&mut self.acc.last_readings, SUFFIX_RAW, reading) {
            let price = self.price_at(store, t);
            if wh > 0.0 {
                self.acc.energy.raw_import_wh += wh;
                self.acc.cost.raw_import_cost_pln += wh / 1000.0 * price;
            } else if wh < 0.0 {
                self.acc.energy.raw_export_wh += -wh;
                self.acc.cost.raw_export_revenue_pln +=
                    -wh / 1000.0 * price * self.export_coefficient;
            }
        }
        if let Some(wh) = integrate(&mut self.acc.last_readings, SUFFIX_NET_METERING, reading) {
            if wh > 0.0 {
                let (covered, uncovered) = self.acc.nm.consume(wh / 1000.0, t);
                let price = self.price_at(store, t);
                self.acc.nm.import_cost_pln +=
                    covered * self.distribution_fee + uncovered * price;
            } else if wh < 0.0 {
                self.acc.nm.deposit(-wh / 1000.0 * self.net_metering_ratio, t);
            }
        }
        if let Some(wh) = integrate(&mut self.acc.last_readings, SUFFIX_NET_BILLING, reading) {
            if wh > 0.0 {
                self.acc.nb.import(wh / 1000.0, self.fixed_tariff);
            } else if wh < 0.0 {
                let rcem = self.rcem(store, t);
                self.acc.nb.export(-wh / 1000.0, rcem);
            }
        }
    }

    /// Primary pipeline, dispatching by sensor type. Grid readings arrive
    /// here battery-adjusted whenever a battery is attached.
    fn update_primary(&mut self, store: &SensorStore, reading: &Reading) {
        let Some(wh) = integrate(&mut self.acc.last_readings, SUFFIX_PRIMARY, reading) else {
            return;
        };
        let t = reading.timestamp;
        match reading.sensor_type {
            SensorType::GridPower => {
                if wh > 0.0 {
                    self.rollover(t);
                    self.acc.energy.today_import_wh += wh;
                    self.acc.energy.month_import_wh += wh;
                    self.acc.energy.total_import_wh += wh;
                    self.acc.energy.import_wh += wh;
                    self.acc.cost.import_cost_pln += wh / 1000.0 * self.price_at(store, t);
                } else if wh < 0.0 {
                    self.acc.energy.export_wh += -wh;
                    let price = self.price_at(store, t);
                    self.acc.cost.export_revenue_pln +=
                        -wh / 1000.0 * price * self.export_coefficient;
                    if price <= self.cheap_price_threshold {
                        self.acc.cost.cheap_export_wh += -wh;
                        self.acc.cost.cheap_export_events += 1;
                    }
                }
            }
            SensorType::PvPower => {
                if wh > 0.0 {
                    self.acc.energy.pv_wh += wh;
                }
            }
            SensorType::PumpConsumption => {
                if wh > 0.0 {
                    let price = self.price_at(store, t);
                    let cost_pln = wh / 1000.0 * price;
                    self.acc.energy.hp_consumption_wh += wh;
                    self.acc.cost.hp_cost_pln += cost_pln;
                    self.acc.heating.add_consumption(month_key(t), wh, cost_pln);
                    self.acc.load_shift.add_hp(t, wh, cost_pln, price);
                }
            }
            SensorType::PumpProduction => {
                if wh > 0.0 {
                    self.acc.energy.hp_production_wh += wh;
                    self.acc.heating.add_production(month_key(t), wh);
                }
            }
            _ => {}
        }
    }

    /// Drive the shadow arbitrage battery and its day ledger. Silent for
    /// intervals whose day has no usable thresholds.
    fn run_arbitrage_shadow(&mut self, store: &SensorStore, raw_reading: &Reading) {
        if self.alt_battery.is_none() || self.price_sensor.is_none() {
            return;
        }
        let t = raw_reading.timestamp;
        let (low, high) = self.day_thresholds(store, t);
        if low >= high {
            self.acc.arb.note_skipped(t);
            return;
        }
        let price = self.price_at(store, t);
        let Some(alt) = self.alt_battery.as_mut() else {
            return;
        };
        let result = alt.process_arbitrage(raw_reading.value, t, price, low, high);
        let throughput_wh = alt.throughput_wh();
        let capacity_wh = alt.config().capacity_kwh * 1000.0;

        let arb_adjusted = Reading {
            value: result.adjusted_grid_w,
            ..raw_reading.clone()
        };
        if let Some(wh) = integrate(&mut self.acc.last_readings, SUFFIX_ARBITRAGE, &arb_adjusted) {
            if wh > 0.0 {
                self.acc.cost.arb_import_cost_pln += wh / 1000.0 * price;
            } else if wh < 0.0 {
                self.acc.cost.arb_export_revenue_pln +=
                    -wh / 1000.0 * price * self.export_coefficient;
            }
        }

        let raw_net = self.acc.cost.raw_import_cost_pln - self.acc.cost.raw_export_revenue_pln;
        let arb_net = self.acc.cost.arb_import_cost_pln - self.acc.cost.arb_export_revenue_pln;
        self.acc
            .arb
            .record(t, result.battery_power_w, throughput_wh, raw_net, arb_net, capacity_wh);
    }

    /// Zero the today/month counters when positive import first lands in a
    /// new UTC day or month.
    fn rollover(&mut self, t: DateTime<Utc>) {
        let day = start_of_day(t);
        match self.acc.day_marker {
            Some(marker) if day > marker => {
                self.acc.energy.today_import_wh = 0.0;
                self.acc.day_marker = Some(day);
            }
            None => self.acc.day_marker = Some(day),
            _ => {}
        }
        let month = start_of_month(t);
        match self.acc.month_marker {
            Some(marker) if month > marker => {
                self.acc.energy.month_import_wh = 0.0;
                self.acc.month_marker = Some(month);
            }
            None => self.acc.month_marker = Some(month),
            _ => {}
        }
    }

    /// Spot price at `t`: the price sensor's most recent value, 0 without
    /// a sensor or before its first sample.
    pub(crate) fn price_at(&self, store: &SensorStore, t: DateTime<Utc>) -> f64 {
        let Some(sensor_id) = self.price_sensor.as_deref() else {
            return 0.0;
        };
        store
            .reading_at(sensor_id, t)
            .map(|r| r.value)
            .unwrap_or(0.0)
    }

    /// P33/P67 of the calendar day's spot prices, cached per day.
    /// `(0, 0)` when the day has no price data.
    pub(crate) fn day_thresholds(&mut self, store: &SensorStore, t: DateTime<Utc>) -> (f64, f64) {
        let Some(sensor_id) = self.price_sensor.clone() else {
            return (0.0, 0.0);
        };
        let key = t.format("%Y-%m-%d").to_string();
        if let Some(cached) = self.acc.price_day_cache.get(&key) {
            return *cached;
        }
        let day_start = start_of_day(t);
        let mut prices: Vec<f64> = store
            .readings_in_range(&sensor_id, day_start, day_start + Duration::days(1))
            .iter()
            .map(|r| r.value)
            .collect();
        let thresholds = if prices.is_empty() {
            (0.0, 0.0)
        } else {
            prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let n = prices.len();
            let idx33 = ((n - 1) as f64 * 33.0 / 100.0) as usize;
            let idx67 = ((n - 1) as f64 * 67.0 / 100.0) as usize;
            (prices[idx33], prices[idx67])
        };
        self.acc.price_day_cache.insert(key, thresholds);
        thresholds
    }

    /// Monthly average spot price (RCEm), cached per calendar month.
    pub(crate) fn rcem(&mut self, store: &SensorStore, t: DateTime<Utc>) -> f64 {
        let Some(sensor_id) = self.price_sensor.clone() else {
            return 0.0;
        };
        let key = month_key(t);
        if let Some(cached) = self.acc.rcem_cache.get(&key) {
            return *cached;
        }
        let month_start = start_of_month(t);
        let month_end = month_start
            .checked_add_months(Months::new(1))
            .unwrap_or(month_start + Duration::days(31));
        let readings = store.readings_in_range(&sensor_id, month_start, month_end);
        let average = if readings.is_empty() {
            0.0
        } else {
            readings.iter().map(|r| r.value).sum::<f64>() / readings.len() as f64
        };
        self.acc.rcem_cache.insert(key, average);
        average
    }
}
