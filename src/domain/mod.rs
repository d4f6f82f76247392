pub mod constraint;
pub mod device;
pub mod types;

pub use constraint::{Coefficient, Constraint, ConstraintId};
pub use device::{
    Device, DeviceId, DeviceKind, Leaf, LeafTelemetry, PhasePower, PowerSetpoint, PowerSink,
};
pub use types::{ConstraintKind, Phase, PowerKind, Relationship};
