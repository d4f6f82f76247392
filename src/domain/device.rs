use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a converter, chosen by the registering driver.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device-{}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Per-cycle telemetry a driver refreshes before the solver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafTelemetry {
    /// Most negative allowed total active power, in watts. Always <= 0.
    pub allowed_charge_w: i32,
    /// Most positive allowed total active power, in watts. Always >= 0.
    pub allowed_discharge_w: i32,
    /// State of charge in percent. Only steers the rounding direction when a
    /// solution is applied.
    pub soc_percent: u8,
}

impl Default for LeafTelemetry {
    fn default() -> Self {
        Self {
            allowed_charge_w: 0,
            allowed_discharge_w: 0,
            soc_percent: 50,
        }
    }
}

/// One phase's rounded (active, reactive) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePower {
    pub active_w: i32,
    pub reactive_var: i32,
}

/// Integer setpoint handed to a driver after solving and rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerSetpoint {
    /// One symmetric pair for the whole converter; the per-phase values are
    /// a third of it each.
    Symmetric { active_w: i32, reactive_var: i32 },
    /// Independent pairs per phase.
    PerPhase {
        l1: PhasePower,
        l2: PhasePower,
        l3: PhasePower,
    },
}

impl PowerSetpoint {
    /// Total active power across all phases.
    pub fn total_active_w(&self) -> i32 {
        match self {
            PowerSetpoint::Symmetric { active_w, .. } => *active_w,
            PowerSetpoint::PerPhase { l1, l2, l3 } => l1.active_w + l2.active_w + l3.active_w,
        }
    }

    /// Total reactive power across all phases.
    pub fn total_reactive_var(&self) -> i32 {
        match self {
            PowerSetpoint::Symmetric { reactive_var, .. } => *reactive_var,
            PowerSetpoint::PerPhase { l1, l2, l3 } => {
                l1.reactive_var + l2.reactive_var + l3.reactive_var
            }
        }
    }
}

/// Driver-side sink that turns an applied setpoint into hardware writes.
///
/// Transient failures are collected by the applier and reported per device;
/// they never abort application to the remaining devices.
pub trait PowerSink: Send {
    fn apply_power(&mut self, setpoint: PowerSetpoint) -> anyhow::Result<()>;
}

/// A leaf converter's registration data.
pub struct Leaf {
    /// Smallest controllable power increment, in watts.
    pub resolution_w: u32,
    pub telemetry: LeafTelemetry,
    pub sink: Box<dyn PowerSink>,
}

impl fmt::Debug for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leaf")
            .field("resolution_w", &self.resolution_w)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

/// Topology of a registered converter.
#[derive(Debug)]
pub enum DeviceKind {
    /// Converter that accepts one symmetric setpoint; its phases are forced
    /// to track each other.
    SinglePhaseEquivalent(Leaf),
    /// Converter with independently controllable phases.
    PerPhase(Leaf),
    /// Virtual aggregate; its power is the sum of its children's and it never
    /// receives a setpoint itself.
    Composite(Vec<Device>),
}

/// A controllable converter, or a virtual aggregate of converters.
#[derive(Debug)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceKind,
}

impl Device {
    pub fn single_phase_equivalent(
        id: impl Into<DeviceId>,
        resolution_w: u32,
        sink: Box<dyn PowerSink>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: DeviceKind::SinglePhaseEquivalent(Leaf {
                resolution_w,
                telemetry: LeafTelemetry::default(),
                sink,
            }),
        }
    }

    pub fn per_phase(id: impl Into<DeviceId>, resolution_w: u32, sink: Box<dyn PowerSink>) -> Self {
        Self {
            id: id.into(),
            kind: DeviceKind::PerPhase(Leaf {
                resolution_w,
                telemetry: LeafTelemetry::default(),
                sink,
            }),
        }
    }

    pub fn composite(id: impl Into<DeviceId>, children: Vec<Device>) -> Self {
        Self {
            id: id.into(),
            kind: DeviceKind::Composite(children),
        }
    }

    /// Seed the leaf's telemetry at registration time. No effect on
    /// aggregates; drivers refresh telemetry per cycle either way.
    pub fn with_telemetry(mut self, telemetry: LeafTelemetry) -> Self {
        match &mut self.kind {
            DeviceKind::SinglePhaseEquivalent(leaf) | DeviceKind::PerPhase(leaf) => {
                leaf.telemetry = telemetry;
            }
            DeviceKind::Composite(_) => {}
        }
        self
    }
}
