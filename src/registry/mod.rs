//! Device registry: the source of truth for registered converters, the
//! coefficient index and the live constraint set.
//!
//! Devices are stored in an arena keyed by their stable id; aggregates hold
//! child-id lists rather than direct references. The registry derives
//! structural constraints (phase symmetry for single-phase-equivalent
//! converters, charge/discharge envelopes) and expands aggregate coefficients
//! down to leaf slots when the linear system is built.

pub mod index;

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::domain::{
    Coefficient, Constraint, ConstraintId, ConstraintKind, Device, DeviceId, DeviceKind, Leaf,
    LeafTelemetry, Phase, PowerKind, PowerSetpoint, PowerSink, Relationship,
};
use crate::error::PowerError;

pub use index::CoefficientIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafTopology {
    SinglePhaseEquivalent,
    PerPhase,
}

struct LeafEntry {
    topology: LeafTopology,
    resolution_w: u32,
    telemetry: LeafTelemetry,
    sink: Box<dyn PowerSink>,
}

enum DeviceEntry {
    Leaf(LeafEntry),
    Composite(Vec<DeviceId>),
}

/// Snapshot of the leaf data the applier needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeafInfo {
    pub topology: LeafTopology,
    pub resolution_w: u32,
    pub soc_percent: u8,
}

/// One dense row of the linear system.
#[derive(Debug, Clone)]
pub(crate) struct LinearRow {
    pub description: String,
    pub terms: Vec<(usize, f64)>,
    pub relationship: Relationship,
    pub value: f64,
}

/// The registry's constraint set expanded to leaf slots, plus the derived
/// envelope rows. `covered` marks slots referenced by at least one enabled
/// caller-issued constraint; uncovered slots have no scheduler-issued target
/// and default to "do nothing".
#[derive(Debug, Clone)]
pub(crate) struct LinearSystem {
    pub slot_count: usize,
    pub rows: Vec<LinearRow>,
    pub covered: Vec<bool>,
}

/// Owns the registered converter fleet and the live constraint lists.
///
/// All mutation must be externally serialized against solving; the
/// [`PowerDistributor`](crate::distributor::PowerDistributor) wraps a
/// registry in a single coarse lock for exactly that reason. Multiple
/// registries can coexist (e.g. in tests) since nothing here is global.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceEntry>,
    order: Vec<DeviceId>,
    index: CoefficientIndex,
    static_constraints: Vec<(ConstraintId, Constraint)>,
    cycle_constraints: Vec<(ConstraintId, Constraint)>,
    structural: HashSet<ConstraintId>,
    last_applied: HashMap<Coefficient, f64>,
    next_constraint_id: u64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a leaf or an aggregate tree. Children of an aggregate are
    /// registered recursively; single-phase-equivalent leaves get their
    /// phase-symmetry constraints added automatically.
    pub fn register_device(&mut self, device: Device) -> Result<(), PowerError> {
        let mut tree_ids = Vec::new();
        collect_ids(&device, &mut tree_ids);

        let mut seen = HashSet::new();
        for id in &tree_ids {
            if !seen.insert(*id) {
                return Err(PowerError::SelfReferencingComposite(*id));
            }
            if self.devices.contains_key(id) {
                return Err(PowerError::DuplicateDevice(*id));
            }
        }

        let mut symmetric_leaves = Vec::new();
        self.insert_tree(device, &mut symmetric_leaves);
        self.rebuild_index();
        for id in symmetric_leaves {
            self.add_symmetry_constraints(id);
        }
        debug!(devices = self.order.len(), slots = self.index.len(), "registered device tree");
        Ok(())
    }

    /// Removes a device. An aggregate takes its registered descendants with
    /// it. Every constraint whose expansion touches the removed subtree is
    /// removed as well, of either lifetime class.
    pub fn deregister_device(&mut self, id: DeviceId) -> Result<(), PowerError> {
        if !self.devices.contains_key(&id) {
            return Err(PowerError::UnknownDevice(id));
        }
        let removed: HashSet<DeviceId> = self.reachable_ids(id).into_iter().collect();

        let affected: HashSet<ConstraintId> = self
            .static_constraints
            .iter()
            .chain(self.cycle_constraints.iter())
            .filter(|(_, constraint)| {
                constraint.terms.iter().any(|(coefficient, _)| {
                    self.reachable_ids(coefficient.device)
                        .iter()
                        .any(|device| removed.contains(device))
                })
            })
            .map(|(constraint_id, _)| *constraint_id)
            .collect();

        self.static_constraints
            .retain(|(constraint_id, _)| !affected.contains(constraint_id));
        self.cycle_constraints
            .retain(|(constraint_id, _)| !affected.contains(constraint_id));
        self.structural.retain(|constraint_id| !affected.contains(constraint_id));

        for device in &removed {
            self.devices.remove(device);
        }
        self.order.retain(|device| !removed.contains(device));
        for entry in self.devices.values_mut() {
            if let DeviceEntry::Composite(children) = entry {
                children.retain(|child| !removed.contains(child));
            }
        }
        self.last_applied
            .retain(|coefficient, _| !removed.contains(&coefficient.device));
        self.rebuild_index();
        debug!(%id, removed = removed.len(), constraints = affected.len(), "deregistered device");
        Ok(())
    }

    pub fn is_registered(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    /// The coefficient for a registered device. Fails with `UnknownDevice`
    /// for devices that were never registered.
    pub fn coefficient_for(
        &self,
        device: DeviceId,
        phase: Phase,
        power: PowerKind,
    ) -> Result<Coefficient, PowerError> {
        if !self.devices.contains_key(&device) {
            return Err(PowerError::UnknownDevice(device));
        }
        Ok(Coefficient {
            device,
            phase,
            power,
        })
    }

    /// Refreshes a leaf's envelope and state of charge. Expected once per
    /// cycle from the driver, before the solver runs.
    pub fn refresh_telemetry(
        &mut self,
        device: DeviceId,
        telemetry: LeafTelemetry,
    ) -> Result<(), PowerError> {
        match self.devices.get_mut(&device) {
            None => Err(PowerError::UnknownDevice(device)),
            Some(DeviceEntry::Composite(_)) => Err(PowerError::CompositeTelemetry(device)),
            Some(DeviceEntry::Leaf(leaf)) => {
                leaf.telemetry = telemetry;
                Ok(())
            }
        }
    }

    /// Appends a constraint to its lifetime class's list. Every referenced
    /// device must be registered.
    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<ConstraintId, PowerError> {
        for (coefficient, _) in &constraint.terms {
            if !self.devices.contains_key(&coefficient.device) {
                return Err(PowerError::UnknownDevice(coefficient.device));
            }
        }
        Ok(self.push_constraint(constraint, false))
    }

    pub fn remove_constraint(&mut self, id: ConstraintId) -> Result<Constraint, PowerError> {
        for list in [&mut self.static_constraints, &mut self.cycle_constraints] {
            if let Some(position) = list.iter().position(|(constraint_id, _)| *constraint_id == id)
            {
                let (_, constraint) = list.remove(position);
                self.structural.remove(&id);
                return Ok(constraint);
            }
        }
        Err(PowerError::UnknownConstraint(id))
    }

    /// Adjusts a live constraint's value in place. `None` disables it without
    /// removing it.
    pub fn set_constraint_value(
        &mut self,
        id: ConstraintId,
        value: Option<f64>,
    ) -> Result<(), PowerError> {
        for list in [&mut self.static_constraints, &mut self.cycle_constraints] {
            if let Some((_, constraint)) =
                list.iter_mut().find(|(constraint_id, _)| *constraint_id == id)
            {
                constraint.value = value;
                return Ok(());
            }
        }
        Err(PowerError::UnknownConstraint(id))
    }

    /// Drops all cycle constraints; called at the after-write hook.
    pub fn clear_cycle_constraints(&mut self) {
        self.cycle_constraints.clear();
    }

    /// All live constraints, static first, in insertion order.
    pub fn constraints(&self) -> impl Iterator<Item = (ConstraintId, &Constraint)> {
        self.static_constraints
            .iter()
            .chain(self.cycle_constraints.iter())
            .map(|(id, constraint)| (*id, constraint))
    }

    pub fn coefficient_count(&self) -> usize {
        self.index.len()
    }

    pub fn index(&self) -> &CoefficientIndex {
        &self.index
    }

    // ------------------------------------------------------------------
    // Crate-internal surface for the solver and the applier
    // ------------------------------------------------------------------

    /// Expands symbolic terms (aggregates, `Phase::All`) into dense slot
    /// terms, merging duplicate slots.
    pub(crate) fn expand_terms(
        &self,
        terms: &[(Coefficient, f64)],
    ) -> Result<Vec<(usize, f64)>, PowerError> {
        let mut accumulator: BTreeMap<usize, f64> = BTreeMap::new();
        for (coefficient, weight) in terms {
            self.expand_into(coefficient, *weight, &mut accumulator)?;
        }
        Ok(accumulator
            .into_iter()
            .filter(|(_, weight)| *weight != 0.0)
            .collect())
    }

    /// Builds the full linear view of the registry: enabled constraints
    /// expanded to slots plus the per-leaf envelope rows. The envelope always
    /// straddles zero, so the all-zero assignment satisfies every derived
    /// row.
    pub(crate) fn linear_system(&self) -> Result<LinearSystem, PowerError> {
        let slot_count = self.index.len();
        let mut rows = Vec::new();
        let mut covered = vec![false; slot_count];

        for (id, constraint) in self
            .static_constraints
            .iter()
            .chain(self.cycle_constraints.iter())
        {
            let Some(value) = constraint.value else {
                continue;
            };
            let terms = self.expand_terms(&constraint.terms)?;
            if !self.structural.contains(id) {
                for (slot, _) in &terms {
                    covered[*slot] = true;
                }
            }
            rows.push(LinearRow {
                description: constraint.description.clone(),
                terms,
                relationship: constraint.relationship,
                value,
            });
        }

        for device in self.leaf_ids() {
            let Some(DeviceEntry::Leaf(leaf)) = self.devices.get(&device) else {
                continue;
            };
            let active_slots: Vec<(usize, f64)> = Phase::SLOT_PHASES
                .iter()
                .filter_map(|phase| self.index.slot(device, *phase, PowerKind::Active))
                .map(|slot| (slot, 1.0))
                .collect();
            rows.push(LinearRow {
                description: format!("{device} allowed charge"),
                terms: active_slots.clone(),
                relationship: Relationship::Geq,
                value: f64::from(leaf.telemetry.allowed_charge_w),
            });
            rows.push(LinearRow {
                description: format!("{device} allowed discharge"),
                terms: active_slots,
                relationship: Relationship::Leq,
                value: f64::from(leaf.telemetry.allowed_discharge_w),
            });
        }

        Ok(LinearSystem {
            slot_count,
            rows,
            covered,
        })
    }

    /// Per-slot targets from the previous cycle's applied values; zero for
    /// slots that were never applied.
    pub(crate) fn targets_from_last_applied(&self) -> Vec<f64> {
        (0..self.index.len())
            .map(|slot| {
                self.index
                    .coefficient_at(slot)
                    .and_then(|(device, phase, power)| {
                        self.last_applied.get(&Coefficient {
                            device,
                            phase,
                            power,
                        })
                    })
                    .copied()
                    .unwrap_or(0.0)
            })
            .collect()
    }

    pub(crate) fn record_applied(&mut self, coefficient: Coefficient, value: f64) {
        self.last_applied.insert(coefficient, value);
    }

    /// Leaf devices in registration order; the order the applier walks.
    pub(crate) fn leaf_ids(&self) -> Vec<DeviceId> {
        self.order
            .iter()
            .filter(|&id| matches!(self.devices.get(id), Some(DeviceEntry::Leaf(_))))
            .copied()
            .collect()
    }

    pub(crate) fn leaf_info(&self, device: DeviceId) -> Option<LeafInfo> {
        match self.devices.get(&device) {
            Some(DeviceEntry::Leaf(leaf)) => Some(LeafInfo {
                topology: leaf.topology,
                resolution_w: leaf.resolution_w,
                soc_percent: leaf.telemetry.soc_percent,
            }),
            _ => None,
        }
    }

    pub(crate) fn sink_apply(
        &mut self,
        device: DeviceId,
        setpoint: PowerSetpoint,
    ) -> anyhow::Result<()> {
        match self.devices.get_mut(&device) {
            Some(DeviceEntry::Leaf(leaf)) => leaf.sink.apply_power(setpoint),
            _ => anyhow::bail!("{device} is not an applicable leaf"),
        }
    }

    pub(crate) fn constraint_dump(&self) -> Vec<&Constraint> {
        self.constraints().map(|(_, constraint)| constraint).collect()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn insert_tree(&mut self, device: Device, symmetric_leaves: &mut Vec<DeviceId>) {
        let Device { id, kind } = device;
        match kind {
            DeviceKind::SinglePhaseEquivalent(leaf) => {
                self.insert_leaf(id, LeafTopology::SinglePhaseEquivalent, leaf);
                symmetric_leaves.push(id);
            }
            DeviceKind::PerPhase(leaf) => {
                self.insert_leaf(id, LeafTopology::PerPhase, leaf);
            }
            DeviceKind::Composite(children) => {
                let child_ids = children.iter().map(|child| child.id).collect();
                self.devices.insert(id, DeviceEntry::Composite(child_ids));
                self.order.push(id);
                for child in children {
                    self.insert_tree(child, symmetric_leaves);
                }
            }
        }
    }

    fn insert_leaf(&mut self, id: DeviceId, topology: LeafTopology, leaf: Leaf) {
        self.devices.insert(
            id,
            DeviceEntry::Leaf(LeafEntry {
                topology,
                resolution_w: leaf.resolution_w,
                telemetry: leaf.telemetry,
                sink: leaf.sink,
            }),
        );
        self.order.push(id);
    }

    fn add_symmetry_constraints(&mut self, device: DeviceId) {
        use strum::IntoEnumIterator;
        for power in PowerKind::iter() {
            for other in [Phase::L2, Phase::L3] {
                let constraint = Constraint::new(
                    format!("{device} keep L1 == {other} ({power})"),
                    ConstraintKind::Static,
                    vec![
                        (
                            Coefficient {
                                device,
                                phase: Phase::L1,
                                power,
                            },
                            1.0,
                        ),
                        (
                            Coefficient {
                                device,
                                phase: other,
                                power,
                            },
                            -1.0,
                        ),
                    ],
                    Relationship::Eq,
                    0.0,
                );
                self.push_constraint(constraint, true);
            }
        }
    }

    fn push_constraint(&mut self, constraint: Constraint, structural: bool) -> ConstraintId {
        let id = ConstraintId(self.next_constraint_id);
        self.next_constraint_id += 1;
        if structural {
            self.structural.insert(id);
        }
        match constraint.kind {
            ConstraintKind::Static => self.static_constraints.push((id, constraint)),
            ConstraintKind::Cycle => self.cycle_constraints.push((id, constraint)),
        }
        id
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for id in &self.order {
            if matches!(self.devices.get(id), Some(DeviceEntry::Leaf(_))) {
                self.index.push_leaf(*id);
            }
        }
    }

    /// The device itself plus every registered descendant.
    fn reachable_ids(&self, root: DeviceId) -> Vec<DeviceId> {
        let mut out = vec![root];
        let mut queue = vec![root];
        while let Some(current) = queue.pop() {
            if let Some(DeviceEntry::Composite(children)) = self.devices.get(&current) {
                for child in children {
                    out.push(*child);
                    queue.push(*child);
                }
            }
        }
        out
    }

    fn expand_into(
        &self,
        coefficient: &Coefficient,
        weight: f64,
        accumulator: &mut BTreeMap<usize, f64>,
    ) -> Result<(), PowerError> {
        match self.devices.get(&coefficient.device) {
            None => Err(PowerError::UnknownDevice(coefficient.device)),
            Some(DeviceEntry::Composite(children)) => {
                for child in children {
                    self.expand_into(
                        &Coefficient {
                            device: *child,
                            ..*coefficient
                        },
                        weight,
                        accumulator,
                    )?;
                }
                Ok(())
            }
            Some(DeviceEntry::Leaf(_)) => {
                let phases: &[Phase] = match coefficient.phase {
                    Phase::All => &Phase::SLOT_PHASES,
                    Phase::L1 => &[Phase::L1],
                    Phase::L2 => &[Phase::L2],
                    Phase::L3 => &[Phase::L3],
                };
                for phase in phases {
                    let slot = self
                        .index
                        .slot(coefficient.device, *phase, coefficient.power)
                        .ok_or(PowerError::UnknownDevice(coefficient.device))?;
                    *accumulator.entry(slot).or_insert(0.0) += weight;
                }
                Ok(())
            }
        }
    }
}

fn collect_ids(device: &Device, out: &mut Vec<DeviceId>) {
    out.push(device.id);
    if let DeviceKind::Composite(children) = &device.kind {
        for child in children {
            collect_ids(child, out);
        }
    }
}
