//! Top-level facade driven by the control cycle.
//!
//! Wraps the registry, solver and applier behind one coarse mutex: slot
//! numbering and the constraint lists are shared mutable state that must not
//! change while a solve is running, so every public entry point serializes
//! against `before_write` and against each other.

use parking_lot::Mutex;
use tracing::info;

use crate::apparent::apparent_power_constraints;
use crate::apply::{apply_solution, ApplyFailure};
use crate::config::PowerConfig;
use crate::domain::{
    Coefficient, Constraint, ConstraintId, ConstraintKind, Device, DeviceId, LeafTelemetry, Phase,
    PowerKind,
};
use crate::error::PowerError;
use crate::registry::DeviceRegistry;
use crate::solver::{Solution, Solver, SolverStatus};

/// Everything that happened in one before-write hook.
#[derive(Debug)]
pub struct CycleReport {
    pub solution: Solution,
    pub failures: Vec<ApplyFailure>,
}

struct Inner {
    registry: DeviceRegistry,
    solver: Solver,
    status: SolverStatus,
    config: PowerConfig,
}

/// Owns the fleet and turns the cycle controller's hooks into solve/apply
/// passes. Drivers register devices and refresh telemetry; upstream
/// controllers add constraints and query flexibility; the cycle controller
/// calls `before_write` then `after_write`.
pub struct PowerDistributor {
    inner: Mutex<Inner>,
}

impl PowerDistributor {
    pub fn new() -> Self {
        Self::with_config(PowerConfig::default())
    }

    pub fn with_config(config: PowerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                registry: DeviceRegistry::new(),
                solver: Solver::new(&config),
                status: SolverStatus::default(),
                config,
            }),
        }
    }

    pub fn register_device(&self, device: Device) -> Result<(), PowerError> {
        self.inner.lock().registry.register_device(device)
    }

    pub fn deregister_device(&self, device: DeviceId) -> Result<(), PowerError> {
        self.inner.lock().registry.deregister_device(device)
    }

    pub fn refresh_telemetry(
        &self,
        device: DeviceId,
        telemetry: LeafTelemetry,
    ) -> Result<(), PowerError> {
        self.inner.lock().registry.refresh_telemetry(device, telemetry)
    }

    pub fn coefficient_for(
        &self,
        device: DeviceId,
        phase: Phase,
        power: PowerKind,
    ) -> Result<Coefficient, PowerError> {
        self.inner.lock().registry.coefficient_for(device, phase, power)
    }

    pub fn add_constraint(&self, constraint: Constraint) -> Result<ConstraintId, PowerError> {
        self.inner.lock().registry.add_constraint(constraint)
    }

    /// Adds a constraint only if the system stays feasible with it; otherwise
    /// nothing is inserted and the offending constraint is reported. The
    /// trial solve and the insertion happen under one lock acquisition, so
    /// the snapshot cannot change in between.
    pub fn add_constraint_validated(
        &self,
        constraint: Constraint,
    ) -> Result<ConstraintId, PowerError> {
        let mut inner = self.inner.lock();
        let Inner {
            registry, solver, ..
        } = &mut *inner;
        solver.check_constraint(registry, &constraint)?;
        registry.add_constraint(constraint)
    }

    /// Builds the inscribed apparent-power polygon for a device using the
    /// configured segment count. The constraints are returned, not inserted;
    /// drivers add them (typically per cycle) like any other request.
    pub fn apparent_power_constraints_for(
        &self,
        device: DeviceId,
        phase: Phase,
        kind: ConstraintKind,
        limit_va: f64,
    ) -> Vec<Constraint> {
        let segments = self.inner.lock().config.circle_segments_per_quadrant;
        apparent_power_constraints(device, phase, kind, limit_va, segments)
    }

    pub fn remove_constraint(&self, constraint: ConstraintId) -> Result<Constraint, PowerError> {
        self.inner.lock().registry.remove_constraint(constraint)
    }

    pub fn set_constraint_value(
        &self,
        constraint: ConstraintId,
        value: Option<f64>,
    ) -> Result<(), PowerError> {
        self.inner.lock().registry.set_constraint_value(constraint, value)
    }

    /// Largest total active power deliverable under the current constraints.
    pub fn max_active_power(&self) -> i32 {
        let inner = self.inner.lock();
        inner.solver.max_active_power(&inner.registry)
    }

    /// Smallest total active power deliverable under the current constraints.
    pub fn min_active_power(&self) -> i32 {
        let inner = self.inner.lock();
        inner.solver.min_active_power(&inner.registry)
    }

    /// Before-write hook: build the model, solve, and push the rounded
    /// setpoints to every leaf's sink.
    pub fn before_write(&self) -> CycleReport {
        let mut inner = self.inner.lock();
        let Inner {
            registry,
            solver,
            status,
            ..
        } = &mut *inner;

        let solution = solver.solve(registry);
        let failures = apply_solution(registry, &solution);

        *status = SolverStatus {
            solved: solution.solved,
            strategy: Some(solution.strategy),
            timed_out: solution.timed_out,
            duration_ms: solution.duration.as_millis() as u64,
            solved_at: Some(chrono::Utc::now()),
        };
        info!(
            solved = solution.solved,
            strategy = %solution.strategy,
            duration_ms = status.duration_ms,
            failures = failures.len(),
            "cycle solved and applied"
        );

        CycleReport { solution, failures }
    }

    /// After-write hook: discard this cycle's constraints.
    pub fn after_write(&self) {
        self.inner.lock().registry.clear_cycle_constraints();
    }

    /// Read-only status of the last solve, for operational monitoring.
    pub fn status(&self) -> SolverStatus {
        self.inner.lock().status.clone()
    }
}

impl Default for PowerDistributor {
    fn default() -> Self {
        Self::new()
    }
}
