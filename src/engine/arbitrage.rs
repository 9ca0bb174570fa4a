//! Per-day ledger of the shadow arbitrage battery: charge/discharge windows,
//! throughput, and earnings against the no-battery baseline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One finished calendar day of arbitrage activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageDayRecord {
    /// `YYYY-MM-DD`.
    pub date: String,
    /// `HH:MM` bounds; charge precedes discharge by construction.
    pub charge_start_time: Option<String>,
    pub charge_end_time: Option<String>,
    pub discharge_start_time: Option<String>,
    pub discharge_end_time: Option<String>,
    pub charge_kwh: f64,
    pub discharge_kwh: f64,
    pub cycles_delta: f64,
    /// Minutes between charge end and discharge start, when both exist.
    pub gap_minutes: i64,
    /// No-battery net cost accrued over the day.
    pub raw_cost_pln: f64,
    /// Arbitrage net cost accrued over the day.
    pub arbitrage_cost_pln: f64,
    pub earnings_pln: f64,
}

/// Running state for the day currently being traversed.
#[derive(Debug, Default)]
pub(crate) struct ArbitrageTracker {
    current_day: String,
    charge_start: Option<String>,
    charge_end: Option<String>,
    discharge_start: Option<String>,
    discharge_end: Option<String>,
    day_start_throughput_wh: f64,
    day_start_raw_cost_pln: f64,
    day_start_arb_cost_pln: f64,
    skip_logged_day: String,
    pub(crate) log: Vec<ArbitrageDayRecord>,
    pub(crate) dirty: bool,
}

impl ArbitrageTracker {
    /// Account one arbitrage step. Rotates (and finalizes) the day when the
    /// calendar date changes; extends the windows per the imposed power.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record(
        &mut self,
        t: DateTime<Utc>,
        battery_power_w: f64,
        throughput_wh: f64,
        raw_net_cost_pln: f64,
        arb_net_cost_pln: f64,
        capacity_wh: f64,
    ) {
        let day = t.format("%Y-%m-%d").to_string();
        let time_of_day = t.format("%H:%M").to_string();

        if !self.current_day.is_empty() && self.current_day != day {
            self.finalize_day(throughput_wh, raw_net_cost_pln, arb_net_cost_pln, capacity_wh);
        }
        if self.current_day != day {
            self.current_day = day;
            self.charge_start = None;
            self.charge_end = None;
            self.discharge_start = None;
            self.discharge_end = None;
            self.day_start_throughput_wh = throughput_wh;
            self.day_start_raw_cost_pln = raw_net_cost_pln;
            self.day_start_arb_cost_pln = arb_net_cost_pln;
        }

        if battery_power_w < 0.0 {
            // the charge window freezes once any discharge is on record
            if self.discharge_start.is_none() {
                self.charge_start.get_or_insert_with(|| time_of_day.clone());
                self.charge_end = Some(time_of_day);
            }
        } else if battery_power_w > 0.0 {
            self.discharge_start.get_or_insert_with(|| time_of_day.clone());
            self.discharge_end = Some(time_of_day);
        }
    }

    /// Degenerate price thresholds leave the ledger untouched; note it once
    /// per day so the silence is attributable.
    pub(crate) fn note_skipped(&mut self, t: DateTime<Utc>) {
        let day = t.format("%Y-%m-%d").to_string();
        if self.skip_logged_day != day {
            debug!(%day, "no usable price thresholds, arbitrage ledger idle");
            self.skip_logged_day = day;
        }
    }

    fn finalize_day(
        &mut self,
        throughput_wh: f64,
        raw_net_cost_pln: f64,
        arb_net_cost_pln: f64,
        capacity_wh: f64,
    ) {
        let throughput_delta_wh = (throughput_wh - self.day_start_throughput_wh).max(0.0);
        let raw_delta = raw_net_cost_pln - self.day_start_raw_cost_pln;
        let arb_delta = arb_net_cost_pln - self.day_start_arb_cost_pln;
        let cycles_delta = if capacity_wh > 0.0 {
            throughput_delta_wh / (2.0 * capacity_wh)
        } else {
            0.0
        };
        let gap_minutes =
            gap_minutes(self.charge_end.as_deref(), self.discharge_start.as_deref());

        self.log.push(ArbitrageDayRecord {
            date: std::mem::take(&mut self.current_day),
            charge_start_time: self.charge_start.take(),
            charge_end_time: self.charge_end.take(),
            discharge_start_time: self.discharge_start.take(),
            discharge_end_time: self.discharge_end.take(),
            charge_kwh: throughput_delta_wh / 2.0 / 1000.0,
            discharge_kwh: throughput_delta_wh / 2.0 / 1000.0,
            cycles_delta,
            gap_minutes,
            raw_cost_pln: raw_delta,
            arbitrage_cost_pln: arb_delta,
            earnings_pln: raw_delta - arb_delta,
        });
        self.dirty = true;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self {
            dirty: true,
            ..Self::default()
        };
    }
}

/// Positive minutes between two `HH:MM` stamps, 0 when either is missing
/// or the order is inverted.
fn gap_minutes(charge_end: Option<&str>, discharge_start: Option<&str>) -> i64 {
    let (Some(end), Some(start)) = (charge_end, discharge_start) else {
        return 0;
    };
    let minutes = |s: &str| -> Option<i64> {
        let (h, m) = s.split_once(':')?;
        Some(h.parse::<i64>().ok()? * 60 + m.parse::<i64>().ok()?)
    };
    match (minutes(end), minutes(start)) {
        (Some(e), Some(s)) if s >= e => s - e,
        _ => 0,
    }
}
