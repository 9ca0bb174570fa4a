//! Summary construction and the post-tick broadcast batch.

use crate::events::{EngineEvent, Summary};
use crate::store::SensorStore;

use super::Inner;

/// Same-weekday window the optimal load shift may move energy within.
const SHIFT_WINDOW_H: u32 = 6;

impl Inner {
    /// Snapshot every accumulator into a summary value. Pure read; the
    /// caller holds the lock.
    pub(crate) fn build_summary(&self, store: &SensorStore) -> Summary {
        let energy = &self.acc.energy;
        let cost = &self.acc.cost;

        let self_consumption_kwh =
            ((energy.pv_wh - energy.raw_export_wh).max(0.0)) / 1000.0;
        let home_demand_kwh = energy.raw_import_wh / 1000.0 + self_consumption_kwh;
        let battery_savings_kwh =
            ((energy.raw_import_wh - energy.import_wh).max(0.0)) / 1000.0;

        let mut summary = Summary {
            total_kwh: energy.total_import_wh / 1000.0,
            today_kwh: energy.today_import_wh / 1000.0,
            month_kwh: energy.month_import_wh / 1000.0,
            grid_import_kwh: energy.import_wh / 1000.0,
            grid_export_kwh: energy.export_wh / 1000.0,
            raw_import_kwh: energy.raw_import_wh / 1000.0,
            raw_export_kwh: energy.raw_export_wh / 1000.0,
            pv_production_kwh: energy.pv_wh / 1000.0,
            hp_consumption_kwh: energy.hp_consumption_wh / 1000.0,
            hp_production_kwh: energy.hp_production_wh / 1000.0,
            home_demand_kwh,
            self_consumption_kwh,
            battery_savings_kwh,
            off_grid_coverage_pct: 0.0,
            import_cost_pln: cost.import_cost_pln,
            export_revenue_pln: cost.export_revenue_pln,
            raw_import_cost_pln: cost.raw_import_cost_pln,
            raw_export_revenue_pln: cost.raw_export_revenue_pln,
            arb_import_cost_pln: cost.arb_import_cost_pln,
            arb_export_revenue_pln: cost.arb_export_revenue_pln,
            nm_import_cost_pln: self.acc.nm.import_cost_pln,
            nm_credit_kwh: self.acc.nm.total_credit_kwh(),
            nb_deposit_pln: self.acc.nb.deposit_pln,
            nb_charged_pln: self.acc.nb.charged_pln,
            cheap_export_kwh: cost.cheap_export_wh / 1000.0,
            cheap_export_events: cost.cheap_export_events,
            hp_cost_pln: cost.hp_cost_pln,
            preheat_cost_pln: self.thermal.preheat_cost_pln(),
            shadow_indoor_temp_c: self.thermal.indoor_temp_c(),
            current_price_pln_kwh: self.price_at(store, self.sim_time),
            battery_soc_percent: self.battery.as_ref().map(|b| b.soc_percent()),
            pv_arrays: self
                .custom_pv
                .as_ref()
                .map(|pv| pv.array_energies())
                .unwrap_or_default(),
        };
        summary.off_grid_coverage_pct = summary.off_grid_coverage(100.0, 100.0);
        summary
    }

    /// Queue Summary plus every per-period report after a tick, Step, Seek
    /// or mode switch. Heavy reports go out only when dirty; HeatingStats
    /// rides along whenever any month exists.
    pub(crate) fn push_reports(&mut self, store: &SensorStore, events: &mut Vec<EngineEvent>) {
        events.push(EngineEvent::SummaryUpdate(self.build_summary(store)));

        if let Some(battery) = self.battery.as_ref() {
            events.push(EngineEvent::BatterySummary(battery.summary()));
        }
        if self.acc.arb.dirty {
            events.push(EngineEvent::ArbitrageDayLog(self.acc.arb.log.clone()));
            self.acc.arb.dirty = false;
        }
        if self.acc.anomaly.dirty {
            events.push(EngineEvent::AnomalyDays(self.acc.anomaly.days.clone()));
            self.acc.anomaly.dirty = false;
        }
        if self.acc.load_shift.dirty {
            events.push(EngineEvent::LoadShiftStats(
                self.acc.load_shift.stats(SHIFT_WINDOW_H),
            ));
            self.acc.load_shift.dirty = false;
        }
        if self.acc.hp_diag_dirty {
            events.push(EngineEvent::HpDiagnostics(self.acc.hp_diag));
            self.acc.hp_diag_dirty = false;
        }
        if self.acc.pq_dirty {
            events.push(EngineEvent::PowerQuality(self.acc.power_quality));
            self.acc.pq_dirty = false;
        }
        if !self.acc.heating.is_empty() {
            events.push(EngineEvent::HeatingStats(self.acc.heating.reports()));
        }
    }
}
