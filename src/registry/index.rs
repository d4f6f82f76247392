use std::collections::HashMap;

use strum::IntoEnumIterator;

use crate::domain::{DeviceId, Phase, PowerKind};

/// Dense variable numbering for the linear system.
///
/// Every registered leaf converter owns six slots, (L1, L2, L3) x (Active,
/// Reactive), allocated in registration order. The index is rebuilt whenever
/// the device set changes so slot numbers stay dense; it is a value owned by
/// the registry and passed into every solver call, never ambient state.
#[derive(Debug, Default, Clone)]
pub struct CoefficientIndex {
    slots: HashMap<(DeviceId, Phase, PowerKind), usize>,
    by_slot: Vec<(DeviceId, Phase, PowerKind)>,
}

impl CoefficientIndex {
    /// Slot number for a leaf's (phase, power-kind) pair, if the device owns
    /// slots. Aggregates and `Phase::All` have no slot of their own.
    pub fn slot(&self, device: DeviceId, phase: Phase, power: PowerKind) -> Option<usize> {
        self.slots.get(&(device, phase, power)).copied()
    }

    /// The (device, phase, power-kind) triple owning a slot.
    pub fn coefficient_at(&self, slot: usize) -> Option<(DeviceId, Phase, PowerKind)> {
        self.by_slot.get(slot).copied()
    }

    pub fn len(&self) -> usize {
        self.by_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }

    /// Slots of every Active-power coefficient, in slot order.
    pub fn active_power_slots(&self) -> Vec<usize> {
        self.by_slot
            .iter()
            .enumerate()
            .filter(|(_, (_, _, power))| *power == PowerKind::Active)
            .map(|(slot, _)| slot)
            .collect()
    }

    pub(crate) fn push_leaf(&mut self, device: DeviceId) {
        for phase in Phase::SLOT_PHASES {
            for power in PowerKind::iter() {
                let slot = self.by_slot.len();
                self.slots.insert((device, phase, power), slot);
                self.by_slot.push((device, phase, power));
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.by_slot.clear();
    }
}
