//! Prediction provider: two chained model seams (outdoor temperature, then
//! grid power) behind pointwise traits, plus the temperature conditioning
//! the models' raw output needs before it can drive a synthetic stream.
//!
//! The networks themselves live outside the crate; anything that loads or
//! runs them implements [`TemperatureModel`] and [`GridPowerModel`].

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::domain::{Reading, SensorType};

/// Pointwise outdoor-temperature prediction for an hour-aligned timestamp.
pub trait TemperatureModel: Send {
    fn predict_temp_c(&self, t: DateTime<Utc>, anomaly_offset_c: f64) -> f64;
}

/// Pointwise grid-power prediction given the outdoor temperature.
pub trait GridPowerModel: Send {
    fn predict_power_w(&self, t: DateTime<Utc>, outdoor_temp_c: f64) -> f64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// AR(1) correlation of the temperature noise.
    pub noise_alpha: f64,
    /// Standard deviation of the temperature noise (°C).
    pub noise_sigma_c: f64,
    pub seed: u64,
    /// Sensor id stamped onto synthetic readings.
    pub sensor_id: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            noise_alpha: 0.9,
            noise_sigma_c: 1.5,
            seed: 42,
            sensor_id: "predicted_grid".to_string(),
        }
    }
}

/// Hours covered by one buffer build.
const BUFFER_HOURS: usize = 24 * 365;

/// Rate-of-change windows: within `w` hours the sequence may move at most
/// `max` °C. Applied bidirectionally until stable.
const RATE_WINDOWS: [(usize, f64); 4] = [(1, 5.0), (4, 10.0), (10, 15.0), (14, 20.0)];

const MAX_CLAMP_PASSES: usize = 50;

pub struct PredictionProvider {
    temp_model: Box<dyn TemperatureModel>,
    grid_model: Box<dyn GridPowerModel>,
    config: ProviderConfig,
    temp_offset_c: f64,
    /// Hourly temperatures from `buffer_start`, conditioned and ready.
    buffer: Vec<f64>,
    buffer_start: Option<DateTime<Utc>>,
    rng: StdRng,
    noise_state: f64,
}

impl PredictionProvider {
    pub fn new(
        temp_model: Box<dyn TemperatureModel>,
        grid_model: Box<dyn GridPowerModel>,
        config: ProviderConfig,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            temp_model,
            grid_model,
            config,
            temp_offset_c: 0.0,
            buffer: Vec::new(),
            buffer_start: None,
            rng,
            noise_state: 0.0,
        }
    }

    /// Build the temperature buffer anchored at `anchor` truncated to the
    /// hour. Discards any previous buffer.
    pub fn init(&mut self, anchor: DateTime<Utc>) {
        self.buffer_start = Some(truncate_to_hour(anchor));
        self.buffer.clear();
        self.noise_state = 0.0;
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.extend_buffer(BUFFER_HOURS);
    }

    /// Init only if no buffer exists yet (comparison mode entry point).
    pub fn ensure_initialized(&mut self, anchor: DateTime<Utc>) {
        if self.buffer_start.is_none() {
            self.init(anchor);
        }
    }

    /// Shift the temperature model's anomaly input. The buffer is rebuilt
    /// lazily from the same anchor.
    pub fn set_temp_offset(&mut self, offset_c: f64) {
        if (offset_c - self.temp_offset_c).abs() > f64::EPSILON {
            self.temp_offset_c = offset_c;
            self.buffer.clear();
            self.noise_state = 0.0;
            self.rng = StdRng::seed_from_u64(self.config.seed);
        }
    }

    pub fn temp_offset_c(&self) -> f64 {
        self.temp_offset_c
    }

    /// Hourly-aligned synthetic grid-power readings covering (from, to].
    pub fn readings_for_range(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Reading> {
        self.ensure_initialized(from);
        let mut out = Vec::new();
        let mut hour = truncate_to_hour(from) + Duration::hours(1);
        while hour <= to {
            if let Some(temp) = self.temp_at_hour(hour) {
                let power = self.grid_model.predict_power_w(hour, temp);
                out.push(Reading {
                    timestamp: hour,
                    sensor_id: self.config.sensor_id.clone(),
                    sensor_type: SensorType::GridPower,
                    value: power,
                    unit: "W".to_string(),
                });
            }
            hour += Duration::hours(1);
        }
        out
    }

    /// Point prediction aligned to a historical timestamp, for parity
    /// comparison. None before the buffer anchor.
    pub fn predicted_power_at(&mut self, t: DateTime<Utc>) -> Option<f64> {
        let temp = self.temp_at_hour(truncate_to_hour(t))?;
        Some(self.grid_model.predict_power_w(t, temp))
    }

    pub fn predicted_temp_at(&mut self, t: DateTime<Utc>) -> Option<f64> {
        self.temp_at_hour(truncate_to_hour(t))
    }

    fn temp_at_hour(&mut self, hour: DateTime<Utc>) -> Option<f64> {
        let start = self.buffer_start?;
        if self.buffer.is_empty() {
            self.extend_buffer(BUFFER_HOURS);
        }
        let offset = (hour - start).num_hours();
        if offset < 0 {
            return None;
        }
        let idx = offset as usize;
        if idx >= self.buffer.len() {
            // queries outran the buffer: grow to cover the index plus a margin
            let needed = idx + 1 - self.buffer.len();
            self.extend_buffer(needed.max(BUFFER_HOURS / 4));
        }
        self.buffer.get(idx).copied()
    }

    fn extend_buffer(&mut self, hours: usize) {
        let Some(start) = self.buffer_start else {
            return;
        };
        let alpha = self.config.noise_alpha.clamp(0.0, 0.999);
        let sigma = self.config.noise_sigma_c.max(0.0);
        let innovation_scale = (1.0 - alpha * alpha).sqrt() * sigma;

        let from = self.buffer.len();
        self.buffer.reserve(hours);
        for i in from..from + hours {
            let t = start + Duration::hours(i as i64);
            let clean = self.temp_model.predict_temp_c(t, self.temp_offset_c);
            let white: f64 = StandardNormal.sample(&mut self.rng);
            self.noise_state = alpha * self.noise_state + innovation_scale * white;
            self.buffer.push(clean + self.noise_state);
        }
        clamp_rate_of_change(&mut self.buffer);
    }
}

/// Iteratively enforce the rate-of-change windows in both directions.
/// The pass cap guarantees termination even on adversarial sequences.
fn clamp_rate_of_change(values: &mut [f64]) {
    for _ in 0..MAX_CLAMP_PASSES {
        let mut changed = false;
        for (window, max_delta) in RATE_WINDOWS {
            if values.len() <= window {
                continue;
            }
            for i in window..values.len() {
                let anchor = values[i - window];
                let clamped = values[i].clamp(anchor - max_delta, anchor + max_delta);
                if (clamped - values[i]).abs() > 1e-12 {
                    values[i] = clamped;
                    changed = true;
                }
            }
            for i in (0..values.len() - window).rev() {
                let anchor = values[i + window];
                let clamped = values[i].clamp(anchor - max_delta, anchor + max_delta);
                if (clamped - values[i]).abs() > 1e-12 {
                    values[i] = clamped;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::minutes(t.minute() as i64)
        - Duration::seconds(t.second() as i64)
        - Duration::nanoseconds(t.nanosecond() as i64)
}
