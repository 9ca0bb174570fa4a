//! Trapezoidal energy integration and the period accumulators it feeds.
//!
//! Every pipeline (adjusted, raw, arbitrage, net-metering, net-billing,
//! PV arrays) keeps its own previous reading per sensor, keyed by
//! `sensor_id + suffix`, so shadow ledgers never contaminate each other.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use std::collections::HashMap;

use crate::domain::Reading;
use crate::events::{AnomalyDayReport, HeatingMonthReport, LoadShiftSlot, LoadShiftStats};

/// Suffixes of the parallel integration pipelines.
pub(crate) const SUFFIX_PRIMARY: &str = "";
pub(crate) const SUFFIX_RAW: &str = ":raw";
pub(crate) const SUFFIX_ARBITRAGE: &str = ":arb";
pub(crate) const SUFFIX_NET_METERING: &str = ":nm";
pub(crate) const SUFFIX_NET_BILLING: &str = ":nb";

/// Trapezoid between this reading and the pipeline's previous one.
///
/// Returns the integrated energy in Wh, or None when this is the first
/// sample for the key (the reading is stored either way). Non-advancing
/// timestamps only refresh the stored sample.
pub(crate) fn integrate(
    last_readings: &mut HashMap<String, Reading>,
    suffix: &str,
    reading: &Reading,
) -> Option<f64> {
    let key = format!("{}{}", reading.sensor_id, suffix);
    let prev = last_readings.insert(key, reading.clone())?;
    let hours = (reading.timestamp - prev.timestamp).num_milliseconds() as f64 / 3_600_000.0;
    if hours <= 0.0 {
        return None;
    }
    Some((prev.value + reading.value) / 2.0 * hours)
}

pub(crate) fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t)
}

pub(crate) fn start_of_month(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

pub(crate) fn month_key(t: DateTime<Utc>) -> String {
    t.format("%Y-%m").to_string()
}

/// Wh counters for every energy stream the summary reports.
#[derive(Debug, Default)]
pub(crate) struct EnergyTotals {
    pub total_import_wh: f64,
    pub today_import_wh: f64,
    pub month_import_wh: f64,
    pub import_wh: f64,
    pub export_wh: f64,
    pub pv_wh: f64,
    pub hp_consumption_wh: f64,
    pub hp_production_wh: f64,
    /// Counterfactual grid flows as observed, before any battery.
    pub raw_import_wh: f64,
    pub raw_export_wh: f64,
}

/// PLN counters next to the energy totals.
#[derive(Debug, Default)]
pub(crate) struct CostTotals {
    pub import_cost_pln: f64,
    pub export_revenue_pln: f64,
    pub raw_import_cost_pln: f64,
    pub raw_export_revenue_pln: f64,
    pub arb_import_cost_pln: f64,
    pub arb_export_revenue_pln: f64,
    pub hp_cost_pln: f64,
    pub cheap_export_wh: f64,
    pub cheap_export_events: u64,
}

#[derive(Debug, Default)]
struct HeatingMonth {
    consumption_wh: f64,
    production_wh: f64,
    cost_pln: f64,
    temp_sum: f64,
    temp_count: u64,
}

/// Calendar-month heating buckets in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct HeatingMonths {
    months: HashMap<String, HeatingMonth>,
    order: Vec<String>,
}

impl HeatingMonths {
    fn bucket(&mut self, month: String) -> &mut HeatingMonth {
        if !self.months.contains_key(&month) {
            self.order.push(month.clone());
        }
        self.months.entry(month).or_default()
    }

    pub(crate) fn add_consumption(&mut self, month: String, wh: f64, cost_pln: f64) {
        let bucket = self.bucket(month);
        bucket.consumption_wh += wh;
        bucket.cost_pln += cost_pln;
    }

    pub(crate) fn add_production(&mut self, month: String, wh: f64) {
        self.bucket(month).production_wh += wh;
    }

    pub(crate) fn add_temp(&mut self, month: String, temp_c: f64) {
        let bucket = self.bucket(month);
        bucket.temp_sum += temp_c;
        bucket.temp_count += 1;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn reports(&self) -> Vec<HeatingMonthReport> {
        self.order
            .iter()
            .filter_map(|month| {
                let bucket = self.months.get(month)?;
                let cop = if bucket.consumption_wh > 0.0 {
                    bucket.production_wh / bucket.consumption_wh
                } else {
                    0.0
                };
                let avg_temp_c = if bucket.temp_count > 0 {
                    bucket.temp_sum / bucket.temp_count as f64
                } else {
                    0.0
                };
                Some(HeatingMonthReport {
                    month: month.clone(),
                    consumption_kwh: bucket.consumption_wh / 1000.0,
                    production_kwh: bucket.production_wh / 1000.0,
                    cop,
                    cost_pln: bucket.cost_pln,
                    avg_temp_c,
                    temp_readings: bucket.temp_count,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ShiftSlot {
    wh: f64,
    cost_pln: f64,
    price_sum: f64,
    price_count: u64,
}

impl ShiftSlot {
    fn avg_price(&self) -> Option<f64> {
        (self.price_count > 0).then(|| self.price_sum / self.price_count as f64)
    }
}

/// Weekday x hour heat-pump load heatmap plus the price context needed to
/// judge how much a schedule shift would save.
#[derive(Debug)]
pub(crate) struct LoadShift {
    slots: [[ShiftSlot; 24]; 7],
    overall_price_sum: f64,
    overall_price_count: u64,
    pub(crate) dirty: bool,
}

impl Default for LoadShift {
    fn default() -> Self {
        Self {
            slots: [[ShiftSlot::default(); 24]; 7],
            overall_price_sum: 0.0,
            overall_price_count: 0,
            dirty: false,
        }
    }
}

impl LoadShift {
    pub(crate) fn add_hp(&mut self, t: DateTime<Utc>, wh: f64, cost_pln: f64, price: f64) {
        let weekday = t.weekday().num_days_from_monday() as usize;
        let hour = t.hour() as usize;
        let slot = &mut self.slots[weekday][hour];
        slot.wh += wh;
        slot.cost_pln += cost_pln;
        slot.price_sum += price;
        slot.price_count += 1;
        self.dirty = true;
    }

    pub(crate) fn observe_price(&mut self, price: f64) {
        self.overall_price_sum += price;
        self.overall_price_count += 1;
    }

    /// Build the broadcast payload. The optimal-shift figure lets every
    /// slot's energy run at the cheapest average price within the window on
    /// the same weekday.
    pub(crate) fn stats(&self, window_h: u32) -> LoadShiftStats {
        let mut heatmap = Vec::with_capacity(7);
        let mut hp_price_sum = 0.0;
        let mut hp_price_count = 0u64;
        let mut shift_current = 0.0;
        let mut shift_optimal = 0.0;

        for day in &self.slots {
            let mut row = Vec::with_capacity(24);
            for (hour, slot) in day.iter().enumerate() {
                row.push(LoadShiftSlot {
                    kwh: slot.wh / 1000.0,
                    avg_price: slot.avg_price().unwrap_or(0.0),
                });
                hp_price_sum += slot.price_sum;
                hp_price_count += slot.price_count;
                if slot.wh <= 0.0 {
                    continue;
                }
                shift_current += slot.cost_pln;
                let lo = hour.saturating_sub(window_h as usize);
                let hi = (hour + window_h as usize).min(23);
                let best = day[lo..=hi]
                    .iter()
                    .filter_map(ShiftSlot::avg_price)
                    .fold(f64::INFINITY, f64::min);
                if best.is_finite() {
                    shift_optimal += slot.wh / 1000.0 * best;
                } else {
                    shift_optimal += slot.cost_pln;
                }
            }
            heatmap.push(row);
        }

        let avg_hp_price = if hp_price_count > 0 {
            hp_price_sum / hp_price_count as f64
        } else {
            0.0
        };
        let overall_avg_price = if self.overall_price_count > 0 {
            self.overall_price_sum / self.overall_price_count as f64
        } else {
            0.0
        };
        LoadShiftStats {
            heatmap,
            avg_hp_price,
            overall_avg_price,
            shift_current_pln: shift_current,
            shift_optimal_pln: shift_optimal,
            shift_savings_pln: (shift_current - shift_optimal).max(0.0),
            shift_window_h: window_h,
        }
    }
}

/// Daily actual-vs-predicted grid energy, trapezoidally integrated from the
/// comparison stream.
#[derive(Debug, Default)]
pub(crate) struct AnomalyTracker {
    current_day: Option<String>,
    actual_wh: f64,
    predicted_wh: f64,
    temp_sum: f64,
    temp_count: u64,
    last_actual: Option<(DateTime<Utc>, f64)>,
    last_predicted: Option<(DateTime<Utc>, f64)>,
    pub(crate) days: Vec<AnomalyDayReport>,
    pub(crate) dirty: bool,
}

impl AnomalyTracker {
    pub(crate) fn is_day_open(&self) -> bool {
        self.current_day.is_some()
    }

    pub(crate) fn add_temp(&mut self, temp_c: f64) {
        if self.current_day.is_some() {
            self.temp_sum += temp_c;
            self.temp_count += 1;
        }
    }

    pub(crate) fn observe(&mut self, t: DateTime<Utc>, actual_w: f64, predicted_w: f64) {
        let day = t.format("%Y-%m-%d").to_string();
        if self.current_day.as_deref() != Some(day.as_str()) {
            if self.current_day.is_some() {
                self.finalize_day();
            }
            self.current_day = Some(day);
        }
        if let Some((prev_t, prev_v)) = self.last_actual {
            let hours = (t - prev_t).num_milliseconds() as f64 / 3_600_000.0;
            if hours > 0.0 {
                self.actual_wh += (prev_v + actual_w) / 2.0 * hours;
            }
        }
        self.last_actual = Some((t, actual_w));
        if let Some((prev_t, prev_v)) = self.last_predicted {
            let hours = (t - prev_t).num_milliseconds() as f64 / 3_600_000.0;
            if hours > 0.0 {
                self.predicted_wh += (prev_v + predicted_w) / 2.0 * hours;
            }
        }
        self.last_predicted = Some((t, predicted_w));
    }

    fn finalize_day(&mut self) {
        let Some(date) = self.current_day.take() else {
            return;
        };
        let actual_kwh = self.actual_wh / 1000.0;
        let predicted_kwh = self.predicted_wh / 1000.0;
        let deviation_pct = if predicted_kwh.abs() > f64::EPSILON {
            (actual_kwh - predicted_kwh) / predicted_kwh.abs() * 100.0
        } else {
            0.0
        };
        let avg_temp_c = if self.temp_count > 0 {
            self.temp_sum / self.temp_count as f64
        } else {
            0.0
        };
        self.days.push(AnomalyDayReport {
            date,
            actual_kwh,
            predicted_kwh,
            deviation_pct,
            avg_temp_c,
        });
        self.actual_wh = 0.0;
        self.predicted_wh = 0.0;
        self.temp_sum = 0.0;
        self.temp_count = 0;
        self.dirty = true;
    }
}
