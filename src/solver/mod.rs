//! The power solver.
//!
//! Consumes the registry's constraint set, proves feasibility, and produces
//! an optimized assignment within a bounded wall-clock budget. The cycle path
//! never fails: when the constraint set is infeasible the fallback cascade
//! degrades step by step down to the always-feasible all-zero assignment.

mod linear;
mod strategy;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use minilp::OptimizationDirection;
use serde::Serialize;
use strum::Display;
use tracing::{debug, error, warn};

use crate::config::{PowerConfig, StrategyKind};
use crate::domain::{Constraint, Relationship};
use crate::error::PowerError;
use crate::registry::{DeviceRegistry, LinearRow, LinearSystem};

use linear::LpOutcome;
use strategy::{KeepAllNearEqual, MoveTowardsTarget, ObjectiveStrategy};

/// How the returned assignment was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum SolveStrategy {
    /// The preferred distance-to-target objective solved to optimality.
    ExactOptimum,
    /// A feasible assignment without the proven optimum, from one of the
    /// degraded cascade steps or a budget cut-off.
    DegradedHeuristic,
    /// Nothing was feasible; every coefficient is zero.
    SafeFallbackZero,
}

/// One cycle's raw variable assignment.
///
/// Values are the LP relaxation over doubles; integer rounding to each
/// device's resolution happens when the solution is applied.
#[derive(Debug, Clone, Serialize)]
pub struct Solution {
    pub values: Vec<f64>,
    pub strategy: SolveStrategy,
    /// False only for the zero fallback.
    pub solved: bool,
    /// The budget ran out before the cascade finished; the values are still
    /// constraint-safe, the optimum just is not proven.
    pub timed_out: bool,
    pub duration: Duration,
}

impl Solution {
    pub fn value_at(&self, slot: usize) -> f64 {
        self.values.get(slot).copied().unwrap_or(0.0)
    }

    fn zero(slot_count: usize, timed_out: bool, duration: Duration) -> Self {
        Self {
            values: vec![0.0; slot_count],
            strategy: SolveStrategy::SafeFallbackZero,
            solved: false,
            timed_out,
            duration,
        }
    }
}

/// Read-only operational status of the last solve, for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SolverStatus {
    pub solved: bool,
    pub strategy: Option<SolveStrategy>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub solved_at: Option<DateTime<Utc>>,
}

/// The solver engine. Stateless between calls: the model is rebuilt from the
/// live registry every cycle, never from the previous solution.
pub struct Solver {
    strategy: Box<dyn ObjectiveStrategy>,
    budget: Duration,
}

impl Solver {
    pub fn new(config: &PowerConfig) -> Self {
        let strategy: Box<dyn ObjectiveStrategy> = match config.strategy {
            StrategyKind::MoveTowardsTarget => Box::new(MoveTowardsTarget),
            StrategyKind::KeepAllNearEqual => Box::new(KeepAllNearEqual),
        };
        Self {
            strategy,
            budget: Duration::from_millis(config.solve_budget_ms),
        }
    }

    /// Solves the current constraint set. Never fails: infeasibility and
    /// timeouts degrade through the cascade and end at the zero assignment,
    /// which violates no envelope because every envelope straddles zero.
    pub fn solve(&self, registry: &DeviceRegistry) -> Solution {
        let started = Instant::now();
        let slot_count = registry.coefficient_count();

        let system = match registry.linear_system() {
            Ok(system) => system,
            Err(error) => {
                error!(
                    %error,
                    constraints = %constraint_dump(registry),
                    "failed to build the linear model; falling back to zero"
                );
                return Solution::zero(slot_count, false, started.elapsed());
            }
        };

        // 1. The preferred objective: stay close to the strategy's targets.
        let last_applied = registry.targets_from_last_applied();
        let targets = self.strategy.targets(&system, &last_applied);
        match linear::solve_l1(&system, &targets) {
            LpOutcome::Solved(values) => {
                debug!(
                    strategy = self.strategy.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "solved to optimality"
                );
                return Solution {
                    values,
                    strategy: SolveStrategy::ExactOptimum,
                    solved: true,
                    timed_out: false,
                    duration: started.elapsed(),
                };
            }
            LpOutcome::Infeasible => {
                debug!(
                    strategy = self.strategy.name(),
                    "constraint set infeasible under the preferred objective"
                );
            }
            LpOutcome::Unbounded => {
                error!(
                    constraints = %constraint_dump(registry),
                    "deviation objective reported unbounded"
                );
            }
        }
        if let Some(solution) = self.budget_cutoff(started, slot_count) {
            return solution;
        }

        // 2. Drop the distance objective, just prove feasibility.
        let zeros = vec![0.0; system.slot_count];
        if let LpOutcome::Solved(values) = linear::solve_l1(&system, &zeros) {
            warn!("returning a feasible but non-optimized assignment");
            return Solution {
                values,
                strategy: SolveStrategy::DegradedHeuristic,
                solved: true,
                timed_out: false,
                duration: started.elapsed(),
            };
        }
        if let Some(solution) = self.budget_cutoff(started, slot_count) {
            return solution;
        }

        // 3. Pin every coefficient nobody constrained to an explicit zero and
        //    retry, so unaddressed converters do nothing instead of being
        //    pushed to an arbitrary extreme.
        let pinned = pin_uncovered(&system);
        if let LpOutcome::Solved(values) = linear::solve_l1(&pinned, &zeros) {
            warn!("solved only after defaulting unconstrained coefficients to zero");
            return Solution {
                values,
                strategy: SolveStrategy::DegradedHeuristic,
                solved: true,
                timed_out: false,
                duration: started.elapsed(),
            };
        }

        warn!(
            constraints = %constraint_dump(registry),
            "no feasible assignment; applying the zero fallback"
        );
        Solution::zero(slot_count, false, started.elapsed())
    }

    /// Whether the current constraint set admits any assignment.
    pub fn is_solvable(&self, registry: &DeviceRegistry) -> bool {
        match registry.linear_system() {
            Err(_) => false,
            Ok(system) => {
                let zeros = vec![0.0; system.slot_count];
                !matches!(linear::solve_l1(&system, &zeros), LpOutcome::Infeasible)
            }
        }
    }

    /// Feasibility check with `trial` merged in, used by the validating
    /// add-path. Identifies the offending constraint on failure; the live
    /// constraint set is never touched.
    pub fn check_constraint(
        &self,
        registry: &DeviceRegistry,
        trial: &Constraint,
    ) -> Result<(), PowerError> {
        let Some(value) = trial.value else {
            // a disabled constraint takes no part in solving
            return Ok(());
        };
        let mut system = registry.linear_system()?;
        let terms = registry.expand_terms(&trial.terms)?;
        system.rows.push(LinearRow {
            description: trial.description.clone(),
            terms,
            relationship: trial.relationship,
            value,
        });
        let zeros = vec![0.0; system.slot_count];
        match linear::solve_l1(&system, &zeros) {
            LpOutcome::Infeasible => Err(PowerError::InfeasibleConstraint {
                description: trial.description.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Largest total active power currently deliverable. Advisory only;
    /// infeasibility yields zero with a warning instead of an error.
    pub fn max_active_power(&self, registry: &DeviceRegistry) -> i32 {
        self.active_power_extremum(registry, OptimizationDirection::Maximize)
    }

    /// Smallest (most negative) total active power currently deliverable.
    pub fn min_active_power(&self, registry: &DeviceRegistry) -> i32 {
        self.active_power_extremum(registry, OptimizationDirection::Minimize)
    }

    fn active_power_extremum(
        &self,
        registry: &DeviceRegistry,
        direction: OptimizationDirection,
    ) -> i32 {
        let system = match registry.linear_system() {
            Ok(system) => system,
            Err(error) => {
                warn!(%error, "unable to build the linear model for the extrema query");
                return 0;
            }
        };
        let active_slots = registry.index().active_power_slots();
        let goal = match direction {
            OptimizationDirection::Maximize => "maximize",
            OptimizationDirection::Minimize => "minimize",
        };
        match linear::solve_sum_objective(&system, &active_slots, direction) {
            LpOutcome::Solved(values) => active_slots
                .iter()
                .map(|slot| values[*slot])
                .sum::<f64>()
                .round() as i32,
            LpOutcome::Infeasible | LpOutcome::Unbounded => {
                warn!(goal, "unable to find the active power extremum; reporting zero");
                0
            }
        }
    }

    fn budget_cutoff(&self, started: Instant, slot_count: usize) -> Option<Solution> {
        if started.elapsed() <= self.budget {
            return None;
        }
        warn!(
            budget_ms = self.budget.as_millis() as u64,
            "solve budget exhausted mid-cascade; returning the zero assignment"
        );
        Some(Solution::zero(slot_count, true, started.elapsed()))
    }
}

fn pin_uncovered(system: &LinearSystem) -> LinearSystem {
    let mut pinned = system.clone();
    for (slot, covered) in system.covered.iter().enumerate() {
        if !covered {
            pinned.rows.push(LinearRow {
                description: format!("slot {slot} defaults to zero"),
                terms: vec![(slot, 1.0)],
                relationship: Relationship::Eq,
                value: 0.0,
            });
        }
    }
    pinned
}

fn constraint_dump(registry: &DeviceRegistry) -> String {
    serde_json::to_string(&registry.constraint_dump())
        .unwrap_or_else(|_| "<unserializable constraint set>".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Constraint, ConstraintKind, Device, DeviceId, LeafTelemetry, Phase, PowerKind,
        PowerSetpoint, PowerSink, Relationship,
    };

    struct NullSink;
    impl PowerSink for NullSink {
        fn apply_power(&mut self, _setpoint: PowerSetpoint) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn telemetry(limit: i32) -> LeafTelemetry {
        LeafTelemetry {
            allowed_charge_w: -limit,
            allowed_discharge_w: limit,
            soc_percent: 50,
        }
    }

    fn solver() -> Solver {
        Solver::new(&PowerConfig::default())
    }

    fn total_request(device: u32, value: i32) -> Constraint {
        Constraint::simple(
            "total active power request",
            ConstraintKind::Cycle,
            DeviceId(device),
            Phase::All,
            PowerKind::Active,
            Relationship::Eq,
            value,
        )
    }

    #[test]
    fn test_per_phase_request_splits_evenly() {
        let mut registry = DeviceRegistry::new();
        registry
            .register_device(
                Device::per_phase(DeviceId(0), 1, Box::new(NullSink))
                    .with_telemetry(telemetry(10_000)),
            )
            .unwrap();
        registry.add_constraint(total_request(0, 6000)).unwrap();

        let solution = solver().solve(&registry);
        assert!(solution.solved);
        assert_eq!(solution.strategy, SolveStrategy::ExactOptimum);
        for phase in Phase::SLOT_PHASES {
            let active = registry.index().slot(DeviceId(0), phase, PowerKind::Active).unwrap();
            let reactive = registry
                .index()
                .slot(DeviceId(0), phase, PowerKind::Reactive)
                .unwrap();
            assert!((solution.value_at(active) - 2000.0).abs() < 1e-6);
            assert!(solution.value_at(reactive).abs() < 1e-6);
        }
    }

    #[test]
    fn test_infeasible_request_falls_back_to_zero() {
        let mut registry = DeviceRegistry::new();
        for id in 0..2 {
            registry
                .register_device(
                    Device::single_phase_equivalent(DeviceId(id), 1, Box::new(NullSink))
                        .with_telemetry(telemetry(2500)),
                )
                .unwrap();
        }
        let cluster_request = Constraint::new(
            "combined request",
            ConstraintKind::Cycle,
            vec![
                (
                    registry
                        .coefficient_for(DeviceId(0), Phase::All, PowerKind::Active)
                        .unwrap(),
                    1.0,
                ),
                (
                    registry
                        .coefficient_for(DeviceId(1), Phase::All, PowerKind::Active)
                        .unwrap(),
                    1.0,
                ),
            ],
            Relationship::Eq,
            8000.0,
        );
        registry.add_constraint(cluster_request).unwrap();

        let solution = solver().solve(&registry);
        assert!(!solution.solved);
        assert_eq!(solution.strategy, SolveStrategy::SafeFallbackZero);
        assert!(solution.values.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn test_symmetry_holds_for_uneven_totals() {
        let mut registry = DeviceRegistry::new();
        registry
            .register_device(
                Device::single_phase_equivalent(DeviceId(0), 1, Box::new(NullSink))
                    .with_telemetry(telemetry(10_000)),
            )
            .unwrap();
        registry.add_constraint(total_request(0, 5000)).unwrap();

        let solution = solver().solve(&registry);
        assert!(solution.solved);
        let slot = |phase, power| registry.index().slot(DeviceId(0), phase, power).unwrap();
        let p1 = solution.value_at(slot(Phase::L1, PowerKind::Active));
        let p2 = solution.value_at(slot(Phase::L2, PowerKind::Active));
        let p3 = solution.value_at(slot(Phase::L3, PowerKind::Active));
        assert!((p1 - p2).abs() < 1e-6);
        assert!((p1 - p3).abs() < 1e-6);
        assert!((p1 + p2 + p3 - 5000.0).abs() < 1e-6);
    }

    #[test]
    fn test_unconstrained_device_does_nothing() {
        let mut registry = DeviceRegistry::new();
        for id in 0..2 {
            registry
                .register_device(
                    Device::per_phase(DeviceId(id), 1, Box::new(NullSink))
                        .with_telemetry(telemetry(10_000)),
                )
                .unwrap();
        }
        registry.add_constraint(total_request(0, 3000)).unwrap();

        let solution = solver().solve(&registry);
        assert!(solution.solved);
        for phase in Phase::SLOT_PHASES {
            let idle = registry.index().slot(DeviceId(1), phase, PowerKind::Active).unwrap();
            assert!(solution.value_at(idle).abs() < 1e-6);
        }
    }

    #[test]
    fn test_extrema_follow_the_envelope() {
        let mut registry = DeviceRegistry::new();
        for id in 0..2 {
            registry
                .register_device(
                    Device::single_phase_equivalent(DeviceId(id), 1, Box::new(NullSink))
                        .with_telemetry(telemetry(500)),
                )
                .unwrap();
        }
        let solver = solver();
        assert_eq!(solver.max_active_power(&registry), 1000);
        assert_eq!(solver.min_active_power(&registry), -1000);

        registry
            .refresh_telemetry(
                DeviceId(0),
                LeafTelemetry {
                    allowed_charge_w: -1500,
                    allowed_discharge_w: 500,
                    soc_percent: 50,
                },
            )
            .unwrap();
        assert_eq!(solver.min_active_power(&registry), -2000);
    }

    #[test]
    fn test_check_constraint_rejects_infeasible_trial() {
        let mut registry = DeviceRegistry::new();
        registry
            .register_device(
                Device::per_phase(DeviceId(0), 1, Box::new(NullSink))
                    .with_telemetry(telemetry(5000)),
            )
            .unwrap();

        let solver = solver();
        let overload = total_request(0, 8000);
        let err = solver.check_constraint(&registry, &overload).unwrap_err();
        assert!(matches!(err, PowerError::InfeasibleConstraint { .. }));

        let fits = total_request(0, 4000);
        assert!(solver.check_constraint(&registry, &fits).is_ok());
        // the trial solve never touched the live set
        assert_eq!(registry.constraints().count(), 0);
    }

    #[test]
    fn test_exhausted_budget_returns_zero_fallback() {
        let mut registry = DeviceRegistry::new();
        registry
            .register_device(
                Device::per_phase(DeviceId(0), 1, Box::new(NullSink))
                    .with_telemetry(telemetry(1000)),
            )
            .unwrap();
        registry.add_constraint(total_request(0, 9000)).unwrap();

        let config = PowerConfig {
            solve_budget_ms: 0,
            ..PowerConfig::default()
        };
        let solution = Solver::new(&config).solve(&registry);
        assert!(!solution.solved);
        assert!(solution.timed_out);
        assert!(solution.values.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn test_feasible_solve_ignores_exhausted_budget() {
        let mut registry = DeviceRegistry::new();
        registry
            .register_device(
                Device::per_phase(DeviceId(0), 1, Box::new(NullSink))
                    .with_telemetry(telemetry(5000)),
            )
            .unwrap();
        registry.add_constraint(total_request(0, 3000)).unwrap();

        let config = PowerConfig {
            solve_budget_ms: 0,
            ..PowerConfig::default()
        };
        let solution = Solver::new(&config).solve(&registry);
        // the first cascade step always runs to completion
        assert!(solution.solved);
        assert!(!solution.timed_out);
    }

    #[test]
    fn test_keep_all_near_equal_splits_cluster() {
        let mut registry = DeviceRegistry::new();
        let cluster = Device::composite(
            DeviceId(0),
            vec![
                Device::single_phase_equivalent(DeviceId(1), 1, Box::new(NullSink))
                    .with_telemetry(telemetry(50_000)),
                Device::single_phase_equivalent(DeviceId(2), 1, Box::new(NullSink))
                    .with_telemetry(telemetry(50_000)),
            ],
        );
        registry.register_device(cluster).unwrap();
        registry.add_constraint(total_request(0, 6000)).unwrap();

        let config = PowerConfig {
            strategy: StrategyKind::KeepAllNearEqual,
            ..PowerConfig::default()
        };
        let solution = Solver::new(&config).solve(&registry);
        assert!(solution.solved);

        for device in [DeviceId(1), DeviceId(2)] {
            let total: f64 = Phase::SLOT_PHASES
                .iter()
                .map(|phase| {
                    let slot = registry.index().slot(device, *phase, PowerKind::Active).unwrap();
                    solution.value_at(slot)
                })
                .sum();
            assert!((total - 3000.0).abs() < 1e-6, "each member takes half");
        }
    }
}
