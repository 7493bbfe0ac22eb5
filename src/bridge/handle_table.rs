//! Generation-tagged side table of native handles
//!
//! A [`NativeHandle`] packs a slot index and the slot's generation:
//!
//! ```text
//! 63            32 31             0
//! [  generation  ][  index + 1    ]
//! ```
//!
//! Releasing a handle bumps its slot's generation, so a late callback that
//! still carries the old handle resolves to nothing instead of reaching a
//! controller that has since taken the slot.

use std::collections::HashMap;

use super::driver::NativeHandle;
use crate::controller::ControllerIdentity;

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    occupant: Option<ControllerIdentity>,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Slot>,
    by_identity: HashMap<ControllerIdentity, NativeHandle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a handle for `id`, or returns the live one if `id` already has
    /// a handle.
    pub fn insert(&mut self, id: ControllerIdentity) -> NativeHandle {
        if let Some(handle) = self.by_identity.get(&id) {
            return *handle;
        }

        // Lowest free slot first
        let index = match self.slots.iter().position(|slot| slot.occupant.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.occupant = Some(id);
        let handle = pack(index, slot.generation);
        self.by_identity.insert(id, handle);
        handle
    }

    pub fn resolve(&self, handle: NativeHandle) -> Option<ControllerIdentity> {
        let (index, generation) = unpack(handle)?;
        let slot = self.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.occupant
    }

    /// Releases `handle`. Returns the identity it referred to, or `None` if
    /// the handle is stale or was never issued.
    pub fn release(&mut self, handle: NativeHandle) -> Option<ControllerIdentity> {
        let (index, generation) = unpack(handle)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }

        let id = slot.occupant.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.by_identity.remove(&id);
        Some(id)
    }

    pub fn handle_for(&self, id: ControllerIdentity) -> Option<NativeHandle> {
        self.by_identity.get(&id).copied()
    }

    /// Releases every live handle.
    pub fn drain(&mut self) -> Vec<(NativeHandle, ControllerIdentity)> {
        let live: Vec<_> = self
            .by_identity
            .iter()
            .map(|(id, handle)| (*handle, *id))
            .collect();

        for (handle, _) in &live {
            self.release(*handle);
        }
        live
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }
}

fn pack(index: usize, generation: u32) -> NativeHandle {
    NativeHandle(((generation as u64) << 32) | (index as u64 + 1))
}

fn unpack(handle: NativeHandle) -> Option<(usize, u32)> {
    let low = handle.0 & 0xFFFF_FFFF;
    if low == 0 {
        return None;
    }
    Some(((low - 1) as usize, (handle.0 >> 32) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(port: u8) -> ControllerIdentity {
        ControllerIdentity::new(1, port)
    }

    #[test]
    fn issued_handles_are_never_null() {
        let mut table = HandleTable::new();
        let handle = table.insert(id(0));

        assert!(!handle.is_null());
        assert_eq!(table.resolve(handle), Some(id(0)));
        assert_eq!(table.resolve(NativeHandle::NULL), None);
    }

    #[test]
    fn insert_reuses_live_handle_for_same_identity() {
        let mut table = HandleTable::new();
        let first = table.insert(id(2));
        let second = table.insert(id(2));

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn released_handle_is_tombstoned() {
        let mut table = HandleTable::new();
        let handle = table.insert(id(0));

        assert_eq!(table.release(handle), Some(id(0)));
        assert_eq!(table.release(handle), None);
        assert_eq!(table.resolve(handle), None);
        assert_eq!(table.handle_for(id(0)), None);
    }

    #[test]
    fn stale_handle_does_not_reach_new_occupant() {
        let mut table = HandleTable::new();
        let old = table.insert(id(0));
        table.release(old);

        let new = table.insert(id(1));
        assert_ne!(old, new);
        assert_eq!(table.resolve(old), None);
        assert_eq!(table.release(old), None);
        assert_eq!(table.resolve(new), Some(id(1)));
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut table = HandleTable::new();
        let a = table.insert(id(0));
        let _b = table.insert(id(1));
        table.release(a);

        let c = table.insert(id(2));
        assert_eq!(c.0 & 0xFFFF_FFFF, a.0 & 0xFFFF_FFFF);
    }

    #[test]
    fn drain_releases_everything() {
        let mut table = HandleTable::new();
        let a = table.insert(id(0));
        let b = table.insert(id(1));

        let mut drained = table.drain();
        drained.sort_by_key(|(_, id)| *id);
        assert_eq!(drained, vec![(a, id(0)), (b, id(1))]);
        assert!(table.is_empty());
        assert_eq!(table.resolve(a), None);
        assert_eq!(table.resolve(b), None);
    }
}
