//! Battery state machine: one kernel, two control strategies.
//!
//! Self-consumption charges from excess PV and discharges against imports,
//! using the *previous* reading's demand for the interval that ends at the
//! current reading. Arbitrage charges below the day's P33 price and
//! discharges above P67, and may import from the grid to charge.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sizing and SoC limits, as configured by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryConfig {
    pub capacity_kwh: f64,
    /// Max charge and discharge rate (W), symmetric.
    pub max_power_w: f64,
    /// Discharge floor as % of capacity.
    pub discharge_floor_pct: f64,
    /// Charge ceiling as % of capacity.
    pub charge_ceiling_pct: f64,
    /// Equivalent full cycles until 80% capacity remains. 0 disables fade.
    #[serde(default)]
    pub cycles_to_80_pct: f64,
}

/// Outcome of one strategy step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessResult {
    /// Positive = discharge, negative = charge.
    pub battery_power_w: f64,
    /// Grid flow after the battery: raw demand minus battery power.
    pub adjusted_grid_w: f64,
    pub soc_percent: f64,
}

/// Aggregate battery statistics for the `battery:summary` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatterySummary {
    pub soc_percent: f64,
    pub cycles: f64,
    pub throughput_kwh: f64,
    pub effective_capacity_kwh: f64,
    /// Seconds spent at each rounded-kW power level.
    pub time_at_power_sec: BTreeMap<i64, f64>,
    /// Seconds spent in each 10% SoC bucket.
    pub time_at_soc_pct_sec: BTreeMap<i64, f64>,
    /// `YYYY-MM` -> SoC bucket -> seconds.
    pub month_soc_seconds: BTreeMap<String, BTreeMap<i64, f64>>,
}

#[derive(Debug)]
pub struct Battery {
    config: BatteryConfig,
    /// Stored energy. A freshly constructed battery is empty; `reset`
    /// (driven by Seek) moves it to the discharge floor.
    soc_wh: f64,
    last_power_w: f64,
    last_at: Option<DateTime<Utc>>,
    /// Previous reading's demand, the input to the next self-consumption
    /// decision. Kept separate from `last_at` so the arbitrage path never
    /// touches it.
    last_demand_w: f64,
    throughput_wh: f64,
    time_at_power_sec: BTreeMap<i64, f64>,
    time_at_soc_sec: BTreeMap<i64, f64>,
    month_soc_sec: BTreeMap<String, BTreeMap<i64, f64>>,
}

impl Battery {
    pub fn new(config: BatteryConfig) -> Result<Self> {
        if !config.capacity_kwh.is_finite() || config.capacity_kwh <= 0.0 {
            bail!(
                "battery capacity_kwh must be positive and finite, got: {}",
                config.capacity_kwh
            );
        }
        if !config.max_power_w.is_finite() || config.max_power_w <= 0.0 {
            bail!(
                "battery max_power_w must be positive and finite, got: {}",
                config.max_power_w
            );
        }
        if config.discharge_floor_pct < 0.0
            || config.charge_ceiling_pct > 100.0
            || config.discharge_floor_pct >= config.charge_ceiling_pct
        {
            bail!(
                "battery SoC limits must satisfy 0 <= floor < ceiling <= 100, got: {}..{}",
                config.discharge_floor_pct,
                config.charge_ceiling_pct
            );
        }
        if !config.cycles_to_80_pct.is_finite() || config.cycles_to_80_pct < 0.0 {
            bail!(
                "battery cycles_to_80_pct must be non-negative, got: {}",
                config.cycles_to_80_pct
            );
        }
        Ok(Self {
            config,
            soc_wh: 0.0,
            last_power_w: 0.0,
            last_at: None,
            last_demand_w: 0.0,
            throughput_wh: 0.0,
            time_at_power_sec: BTreeMap::new(),
            time_at_soc_sec: BTreeMap::new(),
            month_soc_sec: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &BatteryConfig {
        &self.config
    }

    /// Nameplate capacity scaled by linear cycle fade, never below 40%.
    pub fn effective_capacity_wh(&self) -> f64 {
        let nameplate = self.config.capacity_kwh * 1000.0;
        if self.config.cycles_to_80_pct <= 0.0 {
            return nameplate;
        }
        let cycles = self.throughput_wh / (2.0 * nameplate);
        let factor = (1.0 - 0.2 * cycles / self.config.cycles_to_80_pct).max(0.4);
        nameplate * factor
    }

    pub fn soc_percent(&self) -> f64 {
        100.0 * self.soc_wh / self.effective_capacity_wh()
    }

    pub fn throughput_wh(&self) -> f64 {
        self.throughput_wh
    }

    pub fn cycles(&self) -> f64 {
        self.throughput_wh / (2.0 * self.config.capacity_kwh * 1000.0)
    }

    /// Self-consumption step. The action for the interval [t-1, t] follows
    /// the demand observed at t-1; the current demand is stored for the
    /// next call.
    pub fn process(&mut self, home_demand_w: f64, t: DateTime<Utc>) -> ProcessResult {
        let d_prev = self.last_demand_w;
        let max_w = self.config.max_power_w;
        let desired_w = if d_prev > 0.0 {
            d_prev.min(max_w)
        } else if d_prev < 0.0 {
            -((-d_prev).min(max_w))
        } else {
            0.0
        };
        let result = self.run_kernel(home_demand_w, t, desired_w);
        self.last_demand_w = home_demand_w;
        result
    }

    /// Arbitrage step against the day's price thresholds. Unlike
    /// self-consumption this may import from the grid to charge.
    pub fn process_arbitrage(
        &mut self,
        raw_grid_w: f64,
        t: DateTime<Utc>,
        price: f64,
        low_threshold: f64,
        high_threshold: f64,
    ) -> ProcessResult {
        let desired_w = if price <= low_threshold {
            -self.config.max_power_w
        } else if price >= high_threshold {
            self.config.max_power_w
        } else {
            0.0
        };
        self.run_kernel(raw_grid_w, t, desired_w)
    }

    /// Shared kernel: dwell-time accounting, energy clamping against the
    /// SoC band, state update. `desired_power_w > 0` means discharge.
    fn run_kernel(&mut self, raw_grid_w: f64, t: DateTime<Utc>, desired_power_w: f64) -> ProcessResult {
        let Some(prev_t) = self.last_at else {
            self.last_at = Some(t);
            self.last_power_w = 0.0;
            return ProcessResult {
                battery_power_w: 0.0,
                adjusted_grid_w: raw_grid_w,
                soc_percent: self.soc_percent(),
            };
        };

        let dt_sec = (t - prev_t).num_milliseconds() as f64 / 1000.0;
        if dt_sec <= 0.0 {
            return ProcessResult {
                battery_power_w: 0.0,
                adjusted_grid_w: raw_grid_w,
                soc_percent: self.soc_percent(),
            };
        }
        self.accumulate_dwell(prev_t, dt_sec);

        let cap_wh = self.effective_capacity_wh();
        let floor_wh = cap_wh * self.config.discharge_floor_pct / 100.0;
        let ceiling_wh = cap_wh * self.config.charge_ceiling_pct / 100.0;

        // positive energy = discharge; bounded by charge above the floor
        // and by headroom below the ceiling
        let desired_wh = desired_power_w * dt_sec / 3600.0;
        let max_discharge_wh = (self.soc_wh - floor_wh).max(0.0);
        let max_charge_wh = (ceiling_wh - self.soc_wh).max(0.0);
        let energy_wh = desired_wh.clamp(-max_charge_wh, max_discharge_wh);
        let power_w = energy_wh * 3600.0 / dt_sec;

        self.soc_wh -= energy_wh;
        self.throughput_wh += energy_wh.abs();
        self.last_power_w = power_w;
        self.last_at = Some(t);

        ProcessResult {
            battery_power_w: power_w,
            adjusted_grid_w: raw_grid_w - power_w,
            soc_percent: self.soc_percent(),
        }
    }

    fn accumulate_dwell(&mut self, prev_t: DateTime<Utc>, dt_sec: f64) {
        let power_bucket = (self.last_power_w / 1000.0).round() as i64;
        let soc_bucket = ((self.soc_percent() / 10.0).floor() * 10.0).clamp(0.0, 100.0) as i64;
        *self.time_at_power_sec.entry(power_bucket).or_insert(0.0) += dt_sec;
        *self.time_at_soc_sec.entry(soc_bucket).or_insert(0.0) += dt_sec;
        let month = prev_t.format("%Y-%m").to_string();
        *self
            .month_soc_sec
            .entry(month)
            .or_default()
            .entry(soc_bucket)
            .or_insert(0.0) += dt_sec;
    }

    /// SoC back to the floor, statistics cleared, timestamps forgotten.
    pub fn reset(&mut self) {
        self.throughput_wh = 0.0;
        self.soc_wh =
            self.effective_capacity_wh() * self.config.discharge_floor_pct / 100.0;
        self.last_power_w = 0.0;
        self.last_at = None;
        self.last_demand_w = 0.0;
        self.time_at_power_sec.clear();
        self.time_at_soc_sec.clear();
        self.month_soc_sec.clear();
    }

    pub fn summary(&self) -> BatterySummary {
        BatterySummary {
            soc_percent: self.soc_percent(),
            cycles: self.cycles(),
            throughput_kwh: self.throughput_wh / 1000.0,
            effective_capacity_kwh: self.effective_capacity_wh() / 1000.0,
            time_at_power_sec: self.time_at_power_sec.clone(),
            time_at_soc_pct_sec: self.time_at_soc_sec.clone(),
            month_soc_seconds: self.month_soc_sec.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> BatteryConfig {
        BatteryConfig {
            capacity_kwh: 10.0,
            max_power_w: 5000.0,
            discharge_floor_pct: 10.0,
            charge_ceiling_pct: 100.0,
            cycles_to_80_pct: 0.0,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 21, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_construction_rejects_bad_limits() {
        let mut bad = config();
        bad.capacity_kwh = -1.0;
        assert!(Battery::new(bad).is_err());

        let mut reversed = config();
        reversed.discharge_floor_pct = 90.0;
        reversed.charge_ceiling_pct = 20.0;
        assert!(Battery::new(reversed).is_err());
    }

    #[test]
    fn test_first_reading_imposes_no_power() {
        let mut bat = Battery::new(config()).unwrap();
        let res = bat.process(2500.0, at(0));
        assert_eq!(res.battery_power_w, 0.0);
        assert_eq!(res.adjusted_grid_w, 2500.0);
    }

    #[test]
    fn test_backward_looking_demand_drives_the_interval() {
        let mut bat = Battery::new(config()).unwrap();
        bat.process(-2000.0, at(0));
        // The sign flipped at the current reading, but the interval that
        // just closed was still export per the previous observation.
        let res = bat.process(1000.0, at(1));
        assert_eq!(res.battery_power_w, -2000.0);
        assert_eq!(res.adjusted_grid_w, 3000.0);
    }

    #[test]
    fn test_export_then_import_trace() {
        let mut bat = Battery::new(config()).unwrap();
        let demands = [-2000.0, -2000.0, -2000.0, 1000.0, 1000.0, 1000.0, 1000.0];
        let mut results = Vec::new();
        for (i, d) in demands.iter().enumerate() {
            results.push(bat.process(*d, at(i as u32)));
        }
        assert_eq!(results[0].battery_power_w, 0.0);
        for r in &results[1..4] {
            assert_eq!(r.battery_power_w, -2000.0);
        }
        assert!((results[3].soc_percent - 60.0).abs() < 1e-9);
        assert_eq!(results[4].battery_power_w, 1000.0);
        assert!((results[6].soc_percent - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_discharge_stops_at_floor() {
        let mut bat = Battery::new(config()).unwrap();
        bat.reset(); // floor = 1000 Wh
        bat.process(-5000.0, at(0));
        bat.process(-5000.0, at(1)); // +5000 Wh -> 6000 Wh
        bat.process(5000.0, at(2)); // charged during [1,2) per backward demand
        // now discharge hard for many hours; SoC must never cross the floor
        let mut soc = 0.0;
        for h in 3..8 {
            soc = bat.process(5000.0, at(h)).soc_percent;
        }
        assert!((soc - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_charge_stops_at_ceiling() {
        let mut bat = Battery::new(config()).unwrap();
        for h in 0..6 {
            bat.process(-6000.0, at(h));
        }
        let res = bat.process(-6000.0, at(6));
        assert!(res.soc_percent <= 100.0 + 1e-9);
        assert_eq!(res.battery_power_w, 0.0); // full, nothing to impose
    }

    #[test]
    fn test_flow_identity_holds() {
        let mut bat = Battery::new(config()).unwrap();
        let demands = [-1500.0, 2200.0, -300.0, 4800.0];
        for (i, d) in demands.iter().enumerate() {
            let res = bat.process(*d, at(i as u32));
            assert!((res.adjusted_grid_w - (d - res.battery_power_w)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_arbitrage_charges_cheap_discharges_expensive() {
        let mut bat = Battery::new(config()).unwrap();
        bat.process_arbitrage(1000.0, at(0), 0.2, 0.2, 0.8);
        let charging = bat.process_arbitrage(1000.0, at(1), 0.2, 0.2, 0.8);
        assert_eq!(charging.battery_power_w, -5000.0);
        assert_eq!(charging.adjusted_grid_w, 6000.0);

        let holding = bat.process_arbitrage(1000.0, at(2), 0.5, 0.2, 0.8);
        assert_eq!(holding.battery_power_w, 0.0);

        let discharging = bat.process_arbitrage(1000.0, at(3), 0.8, 0.2, 0.8);
        assert_eq!(discharging.battery_power_w, 5000.0);
        assert_eq!(discharging.adjusted_grid_w, -4000.0);
    }

    #[test]
    fn test_reset_returns_soc_to_floor() {
        let mut bat = Battery::new(config()).unwrap();
        bat.process(-3000.0, at(0));
        bat.process(-3000.0, at(1));
        assert!(bat.throughput_wh() > 0.0);

        bat.reset();
        assert!((bat.soc_percent() - 10.0).abs() < 1e-9);
        assert_eq!(bat.throughput_wh(), 0.0);
        assert!(bat.summary().time_at_power_sec.is_empty());
        // and the next reading is a fresh first reading again
        let res = bat.process(1000.0, at(2));
        assert_eq!(res.battery_power_w, 0.0);
    }

    #[test]
    fn test_dwell_histograms_accumulate() {
        let mut bat = Battery::new(config()).unwrap();
        bat.process(-2000.0, at(0));
        bat.process(-2000.0, at(1));
        bat.process(-2000.0, at(2));
        let summary = bat.summary();
        // one hour at 0 kW (first interval) and one at -2 kW
        assert_eq!(summary.time_at_power_sec.get(&0), Some(&3600.0));
        assert_eq!(summary.time_at_power_sec.get(&-2), Some(&3600.0));
        assert_eq!(summary.month_soc_seconds.len(), 1);
    }

    #[test]
    fn test_cycle_fade_shrinks_effective_capacity() {
        let mut cfg = config();
        cfg.cycles_to_80_pct = 10.0;
        let mut bat = Battery::new(cfg).unwrap();
        let full = bat.effective_capacity_wh();
        // 20 kWh throughput = 1 full cycle = 2% fade
        for h in 0..4 {
            bat.process_arbitrage(0.0, at(h), 0.1, 0.2, 0.8);
        }
        for h in 4..8 {
            bat.process_arbitrage(0.0, at(h), 0.9, 0.2, 0.8);
        }
        assert!(bat.throughput_wh() > 0.0);
        assert!(bat.effective_capacity_wh() < full);
    }
}
