use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// Grid phase selector for a coefficient or constraint term.
///
/// `All` addresses the sum over the three phases and is resolved into the
/// per-phase variable slots when the linear system is built.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
pub enum Phase {
    L1,
    L2,
    L3,
    All,
}

impl Phase {
    /// The phases that own variable slots. `All` is an alias over these.
    pub const SLOT_PHASES: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];
}

/// Active (watts) or reactive (volt-ampere reactive) power.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
)]
pub enum PowerKind {
    Active,
    Reactive,
}

/// Relationship between the weighted coefficient sum and the constraint value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Relationship {
    #[strum(serialize = "=")]
    Eq,
    #[strum(serialize = "<=")]
    Leq,
    #[strum(serialize = ">=")]
    Geq,
}

/// Constraint lifetime class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ConstraintKind {
    /// Survives across control cycles until explicitly removed.
    Static,
    /// Discarded automatically at the after-write hook of the current cycle.
    Cycle,
}
