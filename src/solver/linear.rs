//! minilp problem assembly.
//!
//! The registry hands over dense rows; this module turns them into simplex
//! problems. Two formulations are used: the L1 objective (minimize total
//! absolute deviation from per-slot targets, via auxiliary variables) and a
//! plain weighted-sum objective for the extrema queries.

use minilp::{ComparisonOp, Error as LpError, LinearExpr, OptimizationDirection, Problem, Variable};

use crate::domain::Relationship;
use crate::registry::LinearSystem;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LpOutcome {
    Solved(Vec<f64>),
    Infeasible,
    /// The objective is unbounded. The constraint system itself is still
    /// satisfiable, there is just no finite optimum in this direction.
    Unbounded,
}

fn comparison(relationship: Relationship) -> ComparisonOp {
    match relationship {
        Relationship::Eq => ComparisonOp::Eq,
        Relationship::Leq => ComparisonOp::Le,
        Relationship::Geq => ComparisonOp::Ge,
    }
}

fn add_rows(problem: &mut Problem, system: &LinearSystem, slots: &[Variable]) {
    for row in &system.rows {
        let mut expression = LinearExpr::empty();
        for (slot, weight) in &row.terms {
            expression.add(slots[*slot], *weight);
        }
        problem.add_constraint(expression, comparison(row.relationship), row.value);
    }
}

/// Minimizes the total absolute deviation from `targets` subject to the
/// system rows. Bounded below by zero, so this formulation cannot be
/// unbounded; it doubles as the feasibility certificate with zero targets.
pub(crate) fn solve_l1(system: &LinearSystem, targets: &[f64]) -> LpOutcome {
    if system.slot_count == 0 {
        return LpOutcome::Solved(Vec::new());
    }
    let mut problem = Problem::new(OptimizationDirection::Minimize);
    let slots: Vec<Variable> = (0..system.slot_count)
        .map(|_| problem.add_var(0.0, (f64::NEG_INFINITY, f64::INFINITY)))
        .collect();
    let deviations: Vec<Variable> = (0..system.slot_count)
        .map(|_| problem.add_var(1.0, (0.0, f64::INFINITY)))
        .collect();

    add_rows(&mut problem, system, &slots);

    // deviation >= |slot - target|, linearized as two half-planes
    for slot in 0..system.slot_count {
        let target = targets[slot];

        let mut above = LinearExpr::empty();
        above.add(slots[slot], 1.0);
        above.add(deviations[slot], -1.0);
        problem.add_constraint(above, ComparisonOp::Le, target);

        let mut below = LinearExpr::empty();
        below.add(slots[slot], 1.0);
        below.add(deviations[slot], 1.0);
        problem.add_constraint(below, ComparisonOp::Ge, target);
    }

    match problem.solve() {
        Ok(solution) => LpOutcome::Solved(slots.iter().map(|slot| solution[*slot]).collect()),
        Err(LpError::Infeasible) => LpOutcome::Infeasible,
        Err(LpError::Unbounded) => LpOutcome::Unbounded,
    }
}

/// Optimizes the plain sum of the given slots in the given direction.
pub(crate) fn solve_sum_objective(
    system: &LinearSystem,
    objective_slots: &[usize],
    direction: OptimizationDirection,
) -> LpOutcome {
    if system.slot_count == 0 {
        return LpOutcome::Solved(Vec::new());
    }
    let mut objective = vec![0.0; system.slot_count];
    for slot in objective_slots {
        objective[*slot] = 1.0;
    }

    let mut problem = Problem::new(direction);
    let slots: Vec<Variable> = objective
        .iter()
        .map(|weight| problem.add_var(*weight, (f64::NEG_INFINITY, f64::INFINITY)))
        .collect();

    add_rows(&mut problem, system, &slots);

    match problem.solve() {
        Ok(solution) => LpOutcome::Solved(slots.iter().map(|slot| solution[*slot]).collect()),
        Err(LpError::Infeasible) => LpOutcome::Infeasible,
        Err(LpError::Unbounded) => LpOutcome::Unbounded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LinearRow;

    fn system(slot_count: usize, rows: Vec<LinearRow>) -> LinearSystem {
        LinearSystem {
            slot_count,
            rows,
            covered: vec![true; slot_count],
        }
    }

    fn row(terms: Vec<(usize, f64)>, relationship: Relationship, value: f64) -> LinearRow {
        LinearRow {
            description: "row".into(),
            terms,
            relationship,
            value,
        }
    }

    #[test]
    fn test_l1_reaches_feasible_target() {
        // x0 + x1 = 10, targets (5, 5)
        let system = system(2, vec![row(vec![(0, 1.0), (1, 1.0)], Relationship::Eq, 10.0)]);
        match solve_l1(&system, &[5.0, 5.0]) {
            LpOutcome::Solved(values) => {
                assert!((values[0] - 5.0).abs() < 1e-6);
                assert!((values[1] - 5.0).abs() < 1e-6);
            }
            other => panic!("expected solution, got {other:?}"),
        }
    }

    #[test]
    fn test_l1_projects_onto_constraints() {
        // x0 = 4 fixed; target 10 -> deviation is forced, x0 stays at 4
        let system = system(1, vec![row(vec![(0, 1.0)], Relationship::Eq, 4.0)]);
        match solve_l1(&system, &[10.0]) {
            LpOutcome::Solved(values) => assert!((values[0] - 4.0).abs() < 1e-6),
            other => panic!("expected solution, got {other:?}"),
        }
    }

    #[test]
    fn test_l1_detects_infeasibility() {
        let system = system(
            1,
            vec![
                row(vec![(0, 1.0)], Relationship::Geq, 5.0),
                row(vec![(0, 1.0)], Relationship::Leq, 1.0),
            ],
        );
        assert_eq!(solve_l1(&system, &[0.0]), LpOutcome::Infeasible);
    }

    #[test]
    fn test_sum_objective_extrema() {
        let system = system(
            2,
            vec![
                row(vec![(0, 1.0)], Relationship::Leq, 3.0),
                row(vec![(0, 1.0)], Relationship::Geq, -3.0),
                row(vec![(1, 1.0)], Relationship::Leq, 4.0),
                row(vec![(1, 1.0)], Relationship::Geq, -4.0),
            ],
        );
        match solve_sum_objective(&system, &[0, 1], OptimizationDirection::Maximize) {
            LpOutcome::Solved(values) => {
                assert!((values[0] + values[1] - 7.0).abs() < 1e-6);
            }
            other => panic!("expected solution, got {other:?}"),
        }
    }

    #[test]
    fn test_sum_objective_unbounded() {
        let system = system(1, vec![row(vec![(0, 1.0)], Relationship::Geq, 0.0)]);
        assert_eq!(
            solve_sum_objective(&system, &[0], OptimizationDirection::Maximize),
            LpOutcome::Unbounded
        );
    }
}
