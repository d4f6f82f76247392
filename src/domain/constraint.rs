use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{ConstraintKind, DeviceId, Phase, PowerKind, Relationship};

/// One (device, phase, power-kind) variable of the linear system.
///
/// For a leaf converter this names a single slot (or, with `Phase::All`, the
/// sum of its three phase slots). For an aggregate it names the sum over the
/// aggregate's descendants and is expanded recursively at model-build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coefficient {
    pub device: DeviceId,
    pub phase: Phase,
    pub power: PowerKind,
}

impl fmt::Display for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.device, self.phase, self.power)
    }
}

/// Handle for removing or adjusting a constraint after insertion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConstraintId(pub(crate) u64);

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "constraint-{}", self.0)
    }
}

/// A linear relationship over weighted coefficients.
///
/// A constraint with `value == None` is disabled: it stays registered but is
/// excluded from solving until a value is set. This represents "not yet
/// known" limits without deleting the constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub description: String,
    pub kind: ConstraintKind,
    pub terms: Vec<(Coefficient, f64)>,
    pub relationship: Relationship,
    pub value: Option<f64>,
}

impl Constraint {
    pub fn new(
        description: impl Into<String>,
        kind: ConstraintKind,
        terms: Vec<(Coefficient, f64)>,
        relationship: Relationship,
        value: f64,
    ) -> Self {
        Self {
            description: description.into(),
            kind,
            terms,
            relationship,
            value: Some(value),
        }
    }

    /// A constraint registered without a value; enable it later via
    /// `set_constraint_value`.
    pub fn disabled(
        description: impl Into<String>,
        kind: ConstraintKind,
        terms: Vec<(Coefficient, f64)>,
        relationship: Relationship,
    ) -> Self {
        Self {
            description: description.into(),
            kind,
            terms,
            relationship,
            value: None,
        }
    }

    /// Single-coefficient convenience constructor, the common shape of an
    /// upstream power request ("active power of X = 5000 W").
    pub fn simple(
        description: impl Into<String>,
        kind: ConstraintKind,
        device: impl Into<DeviceId>,
        phase: Phase,
        power: PowerKind,
        relationship: Relationship,
        value_w: i32,
    ) -> Self {
        Self::new(
            description,
            kind,
            vec![(
                Coefficient {
                    device: device.into(),
                    phase,
                    power,
                },
                1.0,
            )],
            relationship,
            f64::from(value_w),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.value.is_some()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms = self
            .terms
            .iter()
            .map(|(coefficient, weight)| format!("{weight}*{coefficient}"))
            .join(" + ");
        match self.value {
            Some(value) => write!(
                f,
                "[{}] {}: {} {} {}",
                self.kind, self.description, terms, self.relationship, value
            ),
            None => write!(
                f,
                "[{}] {}: {} {} <disabled>",
                self.kind, self.description, terms, self.relationship
            ),
        }
    }
}
