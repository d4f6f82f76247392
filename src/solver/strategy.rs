//! Objective strategies.
//!
//! Historically two solver engines existed for this problem; they survive
//! here as interchangeable target policies over the one canonical linear
//! model. A strategy only decides *where the optimizer should try to stay*;
//! the simplex formulation is shared.

use crate::domain::Relationship;
use crate::registry::LinearSystem;

const WEIGHT_EPSILON: f64 = 1e-9;

/// Derives the per-slot target values the L1 objective minimizes against.
pub(crate) trait ObjectiveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn targets(&self, system: &LinearSystem, last_applied: &[f64]) -> Vec<f64>;
}

/// Start from each slot's last applied value, so setpoints move as little as
/// possible between cycles. Slots without any caller-issued constraint fall
/// back to zero; a converter nobody asked anything of does nothing.
pub(crate) struct MoveTowardsTarget;

impl ObjectiveStrategy for MoveTowardsTarget {
    fn name(&self) -> &'static str {
        "move-towards-target"
    }

    fn targets(&self, system: &LinearSystem, last_applied: &[f64]) -> Vec<f64> {
        let mut targets: Vec<f64> = last_applied
            .iter()
            .zip(system.covered.iter())
            .map(|(value, covered)| if *covered { *value } else { 0.0 })
            .collect();
        redistribute_equalities(&mut targets, system);
        targets
    }
}

/// Ignore history: equality totals are split evenly across the coefficients
/// they span, every cycle.
pub(crate) struct KeepAllNearEqual;

impl ObjectiveStrategy for KeepAllNearEqual {
    fn name(&self) -> &'static str {
        "keep-all-near-equal"
    }

    fn targets(&self, system: &LinearSystem, _last_applied: &[f64]) -> Vec<f64> {
        let mut targets = vec![0.0; system.slot_count];
        redistribute_equalities(&mut targets, system);
        targets
    }
}

/// For each equality row, spreads the gap between the row's value and the
/// current weighted target sum evenly over the row's terms. A request like
/// "total active power = X" therefore moves every participating coefficient
/// by the same share instead of letting the simplex pick an arbitrary vertex.
fn redistribute_equalities(targets: &mut [f64], system: &LinearSystem) {
    for row in &system.rows {
        if row.relationship != Relationship::Eq || row.terms.is_empty() {
            continue;
        }
        let weighted_sum: f64 = row
            .terms
            .iter()
            .map(|(slot, weight)| weight * targets[*slot])
            .sum();
        let delta = row.value - weighted_sum;
        if delta.abs() < WEIGHT_EPSILON {
            continue;
        }
        let share = delta / row.terms.len() as f64;
        for (slot, weight) in &row.terms {
            if weight.abs() > WEIGHT_EPSILON {
                targets[*slot] += share / weight;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LinearRow, LinearSystem};

    fn eq_row(terms: Vec<(usize, f64)>, value: f64) -> LinearRow {
        LinearRow {
            description: "eq".into(),
            terms,
            relationship: Relationship::Eq,
            value,
        }
    }

    #[test]
    fn test_redistribution_splits_total_evenly() {
        let system = LinearSystem {
            slot_count: 2,
            rows: vec![eq_row(vec![(0, 1.0), (1, 1.0)], 4000.0)],
            covered: vec![true, true],
        };
        let targets = MoveTowardsTarget.targets(&system, &[1000.0, 1000.0]);
        assert_eq!(targets, vec![2000.0, 2000.0]);
    }

    #[test]
    fn test_uncovered_slots_return_to_zero() {
        let system = LinearSystem {
            slot_count: 2,
            rows: vec![],
            covered: vec![false, true],
        };
        let targets = MoveTowardsTarget.targets(&system, &[1500.0, 700.0]);
        assert_eq!(targets, vec![0.0, 700.0]);
    }

    #[test]
    fn test_keep_all_near_equal_ignores_history() {
        let system = LinearSystem {
            slot_count: 3,
            rows: vec![eq_row(vec![(0, 1.0), (1, 1.0), (2, 1.0)], 6000.0)],
            covered: vec![true, true, true],
        };
        let targets = KeepAllNearEqual.targets(&system, &[5000.0, 0.0, 0.0]);
        assert_eq!(targets, vec![2000.0, 2000.0, 2000.0]);
    }

    #[test]
    fn test_negative_weight_terms_move_toward_satisfaction() {
        // symmetry row: x0 - x1 = 0 with skewed bases converges halfway
        let system = LinearSystem {
            slot_count: 2,
            rows: vec![eq_row(vec![(0, 1.0), (1, -1.0)], 0.0)],
            covered: vec![true, true],
        };
        let targets = MoveTowardsTarget.targets(&system, &[1000.0, 0.0]);
        assert_eq!(targets, vec![500.0, 500.0]);
    }
}
