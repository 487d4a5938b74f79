use serde::Serialize;

use crate::domain::Unit;

const CAP_TOLERANCE: f64 = 1e-9;

/// Open-Meteo's weighted-call formula for one request of `variables` daily
/// variables spanning `days` days.
pub fn weighted_cost(variables: u32, days: u32) -> f64 {
    let base = f64::from(variables) / 10.0;
    base.max(base * (f64::from(days) / 7.0))
}

/// How much of the provider allowance one unit consumes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostModel {
    Flat { per_unit: f64 },
    Weighted { variables: u32, days: u32 },
}

impl CostModel {
    pub fn unit_cost(&self) -> f64 {
        match *self {
            CostModel::Flat { per_unit } => per_unit,
            CostModel::Weighted { variables, days } => weighted_cost(variables, days),
        }
    }
}

/// Run-scoped spend against a cap. Not persisted across runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetLedger {
    pub cap: f64,
    pub spent: f64,
}

impl BudgetLedger {
    pub fn new(cap: f64) -> Self {
        Self { cap, spent: 0.0 }
    }

    pub fn remaining(&self) -> f64 {
        (self.cap - self.spent).max(0.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetTracker {
    model: CostModel,
}

impl BudgetTracker {
    pub fn new(model: CostModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> CostModel {
        self.model
    }

    /// Every unit is one calendar year, so the cost is the model's nominal per-unit cost.
    pub fn cost(&self, _unit: &Unit) -> f64 {
        self.model.unit_cost()
    }

    /// Summed charges drift by a few ulps, so a cap that is an exact multiple of the
    /// unit cost must still admit its last unit.
    pub fn can_afford(&self, ledger: &BudgetLedger, cost: f64) -> bool {
        ledger.spent + cost <= ledger.cap + ledger.cap.abs() * CAP_TOLERANCE
    }

    pub fn charge(&self, ledger: &mut BudgetLedger, cost: f64) {
        ledger.spent += cost;
    }

    pub fn estimate(&self, units: usize) -> f64 {
        units as f64 * self.model.unit_cost()
    }
}

/// Runs needed to spend `total` at `per_run` budget each; `None` when the budget is zero.
pub fn runs_to_complete(total: f64, per_run: f64) -> Option<f64> {
    if per_run > 0.0 {
        Some(total / per_run)
    } else {
        None
    }
}
