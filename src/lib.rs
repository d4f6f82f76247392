//! Power distribution solver for fleets of grid-connected converters.
//!
//! Every control cycle, independently issued power requests and hard device
//! limits are turned into one feasible integer setpoint per converter (and
//! per phase). Requests arrive as linear constraints over (device, phase,
//! power-kind) coefficients; the solver minimizes movement away from the
//! previous cycle's applied values, degrades through a fallback cascade when
//! the set is infeasible, and always answers: a live control loop must
//! never stall on a missing solution.
//!
//! ```
//! use fleet_power_solver::{
//!     Constraint, ConstraintKind, Device, DeviceId, LeafTelemetry, Phase, PowerDistributor,
//!     PowerKind, PowerSetpoint, PowerSink, Relationship,
//! };
//!
//! struct NullSink;
//! impl PowerSink for NullSink {
//!     fn apply_power(&mut self, _setpoint: PowerSetpoint) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let distributor = PowerDistributor::new();
//! distributor
//!     .register_device(
//!         Device::per_phase(DeviceId(0), 1, Box::new(NullSink)).with_telemetry(LeafTelemetry {
//!             allowed_charge_w: -10_000,
//!             allowed_discharge_w: 10_000,
//!             soc_percent: 40,
//!         }),
//!     )
//!     .unwrap();
//!
//! distributor
//!     .add_constraint(Constraint::simple(
//!         "discharge request",
//!         ConstraintKind::Cycle,
//!         DeviceId(0),
//!         Phase::All,
//!         PowerKind::Active,
//!         Relationship::Eq,
//!         6_000,
//!     ))
//!     .unwrap();
//!
//! let report = distributor.before_write();
//! assert!(report.solution.solved);
//! distributor.after_write();
//! ```

pub mod apparent;
pub mod apply;
pub mod config;
pub mod distributor;
pub mod domain;
pub mod error;
pub mod registry;
pub mod solver;

pub use apparent::{apparent_power_constraints, DEFAULT_SEGMENTS_PER_QUADRANT};
pub use apply::ApplyFailure;
pub use config::{PowerConfig, StrategyKind};
pub use distributor::{CycleReport, PowerDistributor};
pub use domain::{
    Coefficient, Constraint, ConstraintId, ConstraintKind, Device, DeviceId, DeviceKind, Leaf,
    LeafTelemetry, Phase, PhasePower, PowerKind, PowerSetpoint, PowerSink, Relationship,
};
pub use error::PowerError;
pub use registry::{CoefficientIndex, DeviceRegistry};
pub use solver::{Solution, SolveStrategy, Solver, SolverStatus};
