//! Counterfactual tariff ledgers: net metering (rolling kWh credit bank)
//! and net billing (PLN deposit at monthly average spot).

use chrono::{DateTime, Datelike, Utc};

use super::energy::start_of_month;

#[derive(Debug, Default, Clone, Copy)]
struct CreditBucket {
    kwh: f64,
    /// Start of the month the credits were last deposited in.
    stamp: Option<DateTime<Utc>>,
}

/// Twelve calendar-month credit buckets addressed by `month - 1`. Credits
/// expire 365 days after their deposit month; imports drain the oldest
/// usable credits first.
#[derive(Debug, Default)]
pub(crate) struct NetMeteringBank {
    buckets: [CreditBucket; 12],
    pub(crate) import_cost_pln: f64,
}

impl NetMeteringBank {
    /// Credit exported energy (already scaled by the net-metering ratio).
    pub(crate) fn deposit(&mut self, kwh: f64, t: DateTime<Utc>) {
        if kwh <= 0.0 {
            return;
        }
        let idx = t.month0() as usize;
        self.expire_bucket(idx, t);
        self.buckets[idx].kwh += kwh;
        self.buckets[idx].stamp = Some(start_of_month(t));
    }

    /// Cover an import from the bank. Returns `(covered, uncovered)` kWh;
    /// the caller prices the two parts separately.
    pub(crate) fn consume(&mut self, kwh: f64, t: DateTime<Utc>) -> (f64, f64) {
        if kwh <= 0.0 {
            return (0.0, 0.0);
        }
        for idx in 0..12 {
            self.expire_bucket(idx, t);
        }
        let mut order: Vec<usize> = (0..12)
            .filter(|&i| self.buckets[i].kwh > 0.0 && self.buckets[i].stamp.is_some())
            .collect();
        order.sort_by_key(|&i| self.buckets[i].stamp);

        let mut remaining = kwh;
        for idx in order {
            if remaining <= 0.0 {
                break;
            }
            let draw = self.buckets[idx].kwh.min(remaining);
            self.buckets[idx].kwh -= draw;
            remaining -= draw;
        }
        (kwh - remaining, remaining)
    }

    pub(crate) fn total_credit_kwh(&self) -> f64 {
        self.buckets.iter().map(|b| b.kwh).sum()
    }

    fn expire_bucket(&mut self, idx: usize, now: DateTime<Utc>) {
        if let Some(stamp) = self.buckets[idx].stamp {
            if (now - stamp).num_days() > 365 {
                self.buckets[idx] = CreditBucket::default();
            }
        }
    }
}

/// Net billing: exports build a PLN deposit at the month's average spot
/// price (RCEm); imports are charged at the fixed tariff, drawing the
/// deposit down before anything lands in `charged`.
#[derive(Debug, Default)]
pub(crate) struct NetBilling {
    pub(crate) deposit_pln: f64,
    pub(crate) charged_pln: f64,
}

impl NetBilling {
    pub(crate) fn export(&mut self, kwh: f64, rcem_pln_per_kwh: f64) {
        if kwh > 0.0 {
            self.deposit_pln += kwh * rcem_pln_per_kwh;
        }
    }

    pub(crate) fn import(&mut self, kwh: f64, tariff_pln_per_kwh: f64) {
        if kwh <= 0.0 {
            return;
        }
        let charge = kwh * tariff_pln_per_kwh;
        let drawn = self.deposit_pln.min(charge);
        self.deposit_pln -= drawn;
        self.charged_pln += charge - drawn;
    }
}
