//! Shadow thermal model: tracks indoor temperature under a "pre-heat when
//! cheap, coast when expensive" schedule and integrates its counterfactual
//! cost against the observed heat-pump activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Building envelope quality, mapped to a fixed heat-loss coefficient.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InsulationLevel {
    Poor,
    #[default]
    Medium,
    Good,
    Excellent,
}

impl InsulationLevel {
    /// Whole-building heat-loss coefficient (W/°C).
    pub fn heat_loss_w_per_c(self) -> f64 {
        match self {
            InsulationLevel::Poor => 350.0,
            InsulationLevel::Medium => 220.0,
            InsulationLevel::Good => 140.0,
            InsulationLevel::Excellent => 90.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThermalConfig {
    pub insulation: InsulationLevel,
    /// Comfort band the pre-heat schedule keeps the building inside.
    pub comfort_low_c: f64,
    pub comfort_high_c: f64,
    /// Lumped thermal capacity (J/°C).
    pub thermal_capacity_j_per_c: f64,
    /// COP assumed when no observed COP reading is available.
    pub default_cop: f64,
    pub initial_indoor_c: f64,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            insulation: InsulationLevel::Medium,
            comfort_low_c: 20.0,
            comfort_high_c: 22.0,
            thermal_capacity_j_per_c: 40.0e6,
            default_cop: 3.0,
            initial_indoor_c: 21.0,
        }
    }
}

#[derive(Debug)]
pub struct ThermalModel {
    config: ThermalConfig,
    indoor_c: f64,
    preheat_cost_pln: f64,
    last_at: Option<DateTime<Utc>>,
}

impl ThermalModel {
    pub fn new(config: ThermalConfig) -> Self {
        Self {
            indoor_c: config.initial_indoor_c,
            preheat_cost_pln: 0.0,
            last_at: None,
            config,
        }
    }

    pub fn indoor_temp_c(&self) -> f64 {
        self.indoor_c
    }

    pub fn preheat_cost_pln(&self) -> f64 {
        self.preheat_cost_pln
    }

    pub fn set_insulation(&mut self, level: InsulationLevel) {
        self.config.insulation = level;
    }

    /// Advance the shadow building by one observed heat-pump sample.
    ///
    /// During cheap hours (price at or below `price_low`) the schedule runs
    /// the pump as observed while the building is under the upper comfort
    /// bound; during expensive hours (at or above `price_high`) it coasts
    /// while the building stays above the lower bound; otherwise it tracks
    /// the observed power. Degenerate thresholds (low >= high, the no-price
    /// case) always track.
    pub fn step(
        &mut self,
        outdoor_c: f64,
        price_now: f64,
        price_low: f64,
        price_high: f64,
        observed_hp_w: f64,
        observed_cop: f64,
        t: DateTime<Utc>,
    ) {
        let Some(prev_t) = self.last_at else {
            self.last_at = Some(t);
            return;
        };
        let dt_sec = (t - prev_t).num_milliseconds() as f64 / 1000.0;
        if dt_sec <= 0.0 {
            return;
        }
        self.last_at = Some(t);

        let thresholds_valid = price_low < price_high;
        let q_hp_w = if thresholds_valid
            && price_now <= price_low
            && self.indoor_c < self.config.comfort_high_c
        {
            observed_hp_w
        } else if thresholds_valid
            && price_now >= price_high
            && self.indoor_c > self.config.comfort_low_c
        {
            0.0
        } else {
            observed_hp_w
        };

        let cop = if observed_cop > 0.0 {
            observed_cop
        } else {
            self.config.default_cop
        };
        let k = self.config.insulation.heat_loss_w_per_c();
        let net_heat_w = k * (outdoor_c - self.indoor_c) + cop * q_hp_w;
        let delta_c = net_heat_w * dt_sec / self.config.thermal_capacity_j_per_c;
        self.indoor_c = (self.indoor_c + delta_c).clamp(-20.0, 40.0);

        self.preheat_cost_pln += q_hp_w * dt_sec / 3600.0 / 1000.0 * price_now;
    }

    /// Back to the default indoor temperature with a zeroed cost ledger.
    pub fn reset(&mut self) {
        self.indoor_c = self.config.initial_indoor_c;
        self.preheat_cost_pln = 0.0;
        self.last_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_building_cools_without_heating() {
        let mut model = ThermalModel::new(ThermalConfig::default());
        model.step(-10.0, 0.5, 0.2, 0.8, 0.0, 3.0, at(0));
        model.step(-10.0, 0.5, 0.2, 0.8, 0.0, 3.0, at(6));
        assert!(model.indoor_temp_c() < 21.0);
    }

    #[test]
    fn test_heating_warms_the_building() {
        let mut model = ThermalModel::new(ThermalConfig::default());
        model.step(-5.0, 0.5, 0.2, 0.8, 3000.0, 3.5, at(0));
        model.step(-5.0, 0.5, 0.2, 0.8, 3000.0, 3.5, at(4));
        assert!(model.indoor_temp_c() > 21.0);
    }

    #[test]
    fn test_expensive_hours_coast() {
        let mut model = ThermalModel::new(ThermalConfig::default());
        model.step(-5.0, 0.9, 0.2, 0.8, 2000.0, 3.0, at(0));
        model.step(-5.0, 0.9, 0.2, 0.8, 2000.0, 3.0, at(1));
        // coasting: no pump energy billed to the shadow schedule
        assert_eq!(model.preheat_cost_pln(), 0.0);
        assert!(model.indoor_temp_c() < 21.0);
    }

    #[test]
    fn test_cheap_hours_bill_at_spot() {
        let mut model = ThermalModel::new(ThermalConfig::default());
        model.step(0.0, 0.1, 0.2, 0.8, 2000.0, 3.0, at(0));
        model.step(0.0, 0.1, 0.2, 0.8, 2000.0, 3.0, at(1));
        // 2 kW for one hour at 0.1 PLN/kWh
        assert!((model.preheat_cost_pln() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_thresholds_track_observed() {
        let mut model = ThermalModel::new(ThermalConfig::default());
        model.step(0.0, 0.0, 0.0, 0.0, 2000.0, 3.0, at(0));
        model.step(0.0, 0.0, 0.0, 0.0, 2000.0, 3.0, at(1));
        assert!(model.preheat_cost_pln() == 0.0); // price is zero, not coasting
        assert!(model.indoor_temp_c() > 21.0); // but the heat was injected
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut model = ThermalModel::new(ThermalConfig::default());
        model.step(-10.0, 0.1, 0.2, 0.8, 2000.0, 3.0, at(0));
        model.step(-10.0, 0.1, 0.2, 0.8, 2000.0, 3.0, at(5));
        model.reset();
        assert_eq!(model.indoor_temp_c(), 21.0);
        assert_eq!(model.preheat_cost_pln(), 0.0);
    }
}
