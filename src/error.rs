use thiserror::Error;

use crate::domain::{ConstraintId, DeviceId};

/// Errors surfaced by the registry and the validating constraint path.
///
/// The cycle-driven solve path never returns these: infeasibility there is
/// handled by the fallback cascade and reported through the solution status.
#[derive(Debug, Error)]
pub enum PowerError {
    /// A coefficient or operation was requested for a device that was never
    /// registered. This is a programming error on the caller's side.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("device {0} is already registered")]
    DuplicateDevice(DeviceId),

    /// A composite tree repeated one of its own ids, which would make the
    /// aggregate contain itself.
    #[error("aggregate {0} transitively contains itself")]
    SelfReferencingComposite(DeviceId),

    #[error("no constraint with id {0}")]
    UnknownConstraint(ConstraintId),

    /// Telemetry was pushed for an aggregate; aggregates have no envelope or
    /// state of charge of their own.
    #[error("aggregate {0} carries no telemetry of its own")]
    CompositeTelemetry(DeviceId),

    /// Raised only by the validating add-path. The live constraint set is
    /// left untouched; the caller decides whether to skip the request.
    #[error("constraint \"{description}\" would make the system infeasible")]
    InfeasibleConstraint { description: String },
}
