//! Custom PV: replaces historical PV (and the grid flows it shaped) with
//! the output of user-configured arrays, all derived from one canonical
//! hourly production curve extracted from the historical data.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Reading;
use crate::events::PvArrayEnergy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvArrayConfig {
    pub name: String,
    pub peak_wp: f64,
    /// Compass azimuth of the panel normal (180 = south).
    pub azimuth_deg: f64,
    pub tilt_deg: f64,
    pub enabled: bool,
}

/// Hourly production curve normalized to its historical peak.
#[derive(Debug, Clone)]
pub(crate) struct BaseProfile {
    hourly: [f64; 24],
}

impl BaseProfile {
    /// Average the historical PV stream by hour of day and normalize by the
    /// peak hour. None when there is no usable production at all.
    pub(crate) fn from_history(readings: &[Reading]) -> Option<Self> {
        let mut sums = [0.0f64; 24];
        let mut counts = [0u64; 24];
        for r in readings {
            let hour = r.timestamp.hour() as usize;
            sums[hour] += r.value.max(0.0);
            counts[hour] += 1;
        }
        let mut hourly = [0.0f64; 24];
        for h in 0..24 {
            if counts[h] > 0 {
                hourly[h] = sums[h] / counts[h] as f64;
            }
        }
        let peak = hourly.iter().cloned().fold(0.0f64, f64::max);
        if peak <= 0.0 {
            return None;
        }
        for v in &mut hourly {
            *v /= peak;
        }
        Some(Self { hourly })
    }

    /// Linear interpolation over the 24 h curve with wraparound.
    pub(crate) fn value_at(&self, hour_fractional: f64) -> f64 {
        let h = hour_fractional.rem_euclid(24.0);
        let lo = h.floor() as usize % 24;
        let hi = (lo + 1) % 24;
        let frac = h - h.floor();
        self.hourly[lo] * (1.0 - frac) + self.hourly[hi] * frac
    }
}

/// Active custom-PV configuration with its per-array energy counters.
#[derive(Debug)]
pub(crate) struct CustomPv {
    pub(crate) arrays: Vec<PvArrayConfig>,
    profile: BaseProfile,
    /// Id of the historical PV sensor whose readings get rewritten.
    pub(crate) pv_sensor_id: String,
    array_wh: Vec<f64>,
    last_pv_at: Option<DateTime<Utc>>,
}

impl CustomPv {
    pub(crate) fn new(arrays: Vec<PvArrayConfig>, profile: BaseProfile, pv_sensor_id: String) -> Self {
        let count = arrays.len();
        Self {
            arrays,
            profile,
            pv_sensor_id,
            array_wh: vec![0.0; count],
            last_pv_at: None,
        }
    }

    /// Production of one array at `t`: the base curve shifted east/west by
    /// the azimuth (15° per hour of sun travel) and scaled by a tilt factor
    /// peaking at 35°.
    fn oriented_power_w(&self, array: &PvArrayConfig, t: DateTime<Utc>) -> f64 {
        let hour_fractional =
            t.hour() as f64 + t.minute() as f64 / 60.0 + t.second() as f64 / 3600.0;
        let azimuth_shift_h = (array.azimuth_deg - 180.0) / 15.0;
        let tilt_factor = ((array.tilt_deg - 35.0).to_radians().cos()).clamp(0.15, 1.0);
        self.profile.value_at(hour_fractional - azimuth_shift_h) * tilt_factor * array.peak_wp
    }

    /// Combined production of all enabled arrays at `t`.
    pub(crate) fn total_power_w(&self, t: DateTime<Utc>) -> f64 {
        self.arrays
            .iter()
            .filter(|a| a.enabled)
            .map(|a| self.oriented_power_w(a, t))
            .sum()
    }

    /// Rewrite one PV reading and advance the per-array counters using the
    /// step's power over the elapsed interval.
    pub(crate) fn rewrite_pv_value(&mut self, t: DateTime<Utc>) -> f64 {
        let dt_hours = self
            .last_pv_at
            .map(|prev| ((t - prev).num_milliseconds() as f64 / 3_600_000.0).max(0.0))
            .unwrap_or(0.0);
        self.last_pv_at = Some(t);

        let mut total = 0.0;
        for (i, array) in self.arrays.iter().enumerate() {
            if !array.enabled {
                continue;
            }
            let w = self.oriented_power_w(array, t);
            self.array_wh[i] += w * dt_hours;
            total += w;
        }
        total
    }

    pub(crate) fn array_energies(&self) -> Vec<PvArrayEnergy> {
        self.arrays
            .iter()
            .zip(&self.array_wh)
            .map(|(array, wh)| PvArrayEnergy {
                name: array.name.clone(),
                energy_kwh: wh / 1000.0,
            })
            .collect()
    }

    pub(crate) fn reset_counters(&mut self) {
        self.array_wh.iter_mut().for_each(|wh| *wh = 0.0);
        self.last_pv_at = None;
    }
}
