//! Maps a raw solver solution back onto the registered converters.
//!
//! Each leaf's slot values are rounded to the device's power resolution with
//! a sign- and state-of-charge-aware policy, then handed to the device's
//! sink. Aggregates receive no call; their members do. A failing sink never
//! aborts application to the remaining devices.

use std::fmt;

use tracing::warn;

use crate::domain::{Coefficient, DeviceId, Phase, PhasePower, PowerKind, PowerSetpoint};
use crate::registry::{DeviceRegistry, LeafTopology};
use crate::solver::Solution;

/// A device whose sink rejected the applied setpoint this cycle.
#[derive(Debug)]
pub struct ApplyFailure {
    pub device: DeviceId,
    pub error: anyhow::Error,
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.device, self.error)
    }
}

/// Applies `solution` to every registered leaf and records the applied
/// values as the targets for the next cycle's distance objective.
pub(crate) fn apply_solution(
    registry: &mut DeviceRegistry,
    solution: &Solution,
) -> Vec<ApplyFailure> {
    let mut failures = Vec::new();

    for device in registry.leaf_ids() {
        let Some(info) = registry.leaf_info(device) else {
            continue;
        };

        let raw = |phase: Phase, power: PowerKind| {
            registry
                .index()
                .slot(device, phase, power)
                .map(|slot| solution.value_at(slot))
                .unwrap_or(0.0)
        };

        let setpoint = match info.topology {
            LeafTopology::PerPhase => {
                let mut pairs = [PhasePower {
                    active_w: 0,
                    reactive_var: 0,
                }; 3];
                for (slot, phase) in Phase::SLOT_PHASES.iter().enumerate() {
                    pairs[slot] = PhasePower {
                        active_w: round_to_resolution(
                            raw(*phase, PowerKind::Active),
                            info.resolution_w,
                            info.soc_percent,
                        ),
                        reactive_var: round_to_resolution(
                            raw(*phase, PowerKind::Reactive),
                            info.resolution_w,
                            info.soc_percent,
                        ),
                    };
                }
                PowerSetpoint::PerPhase {
                    l1: pairs[0],
                    l2: pairs[1],
                    l3: pairs[2],
                }
            }
            LeafTopology::SinglePhaseEquivalent => {
                // symmetry is already enforced; the pair carries the sum
                let active: f64 = Phase::SLOT_PHASES
                    .iter()
                    .map(|phase| raw(*phase, PowerKind::Active))
                    .sum();
                let reactive: f64 = Phase::SLOT_PHASES
                    .iter()
                    .map(|phase| raw(*phase, PowerKind::Reactive))
                    .sum();
                PowerSetpoint::Symmetric {
                    active_w: round_to_resolution(active, info.resolution_w, info.soc_percent),
                    reactive_var: round_to_resolution(
                        reactive,
                        info.resolution_w,
                        info.soc_percent,
                    ),
                }
            }
        };

        record_applied(registry, device, &setpoint);

        if let Err(error) = registry.sink_apply(device, setpoint) {
            warn!(%device, %error, "apply-power failed; continuing with the remaining devices");
            failures.push(ApplyFailure { device, error });
        }
    }

    failures
}

fn record_applied(registry: &mut DeviceRegistry, device: DeviceId, setpoint: &PowerSetpoint) {
    match setpoint {
        PowerSetpoint::PerPhase { l1, l2, l3 } => {
            for (phase, pair) in Phase::SLOT_PHASES.iter().zip([l1, l2, l3]) {
                record_pair(
                    registry,
                    device,
                    *phase,
                    f64::from(pair.active_w),
                    f64::from(pair.reactive_var),
                );
            }
        }
        PowerSetpoint::Symmetric {
            active_w,
            reactive_var,
        } => {
            for phase in Phase::SLOT_PHASES {
                record_pair(
                    registry,
                    device,
                    phase,
                    f64::from(*active_w) / 3.0,
                    f64::from(*reactive_var) / 3.0,
                );
            }
        }
    }
}

fn record_pair(
    registry: &mut DeviceRegistry,
    device: DeviceId,
    phase: Phase,
    active: f64,
    reactive: f64,
) {
    registry.record_applied(
        Coefficient {
            device,
            phase,
            power: PowerKind::Active,
        },
        active,
    );
    registry.record_applied(
        Coefficient {
            device,
            phase,
            power: PowerKind::Reactive,
        },
        reactive,
    );
}

/// Rounds a raw power value to the device's resolution.
///
/// On discharge (value > 0) rounds up when the state of charge is above
/// 50 %, otherwise down; on charge (value < 0) the direction is inverted.
/// The rounding error thereby leans on the device with more headroom.
pub(crate) fn round_to_resolution(value: f64, resolution_w: u32, soc_percent: u8) -> i32 {
    let step = f64::from(resolution_w.max(1));
    let scaled = value / step;

    // tolerate simplex round-off before committing to a direction
    let nearest = scaled.round();
    let scaled = if (scaled - nearest).abs() < 1e-4 {
        nearest
    } else {
        scaled
    };

    let round_up = (value > 0.0 && soc_percent > 50) || (value < 0.0 && soc_percent < 50);
    let steps = if round_up { scaled.ceil() } else { scaled.floor() };
    (steps * step) as i32
}
