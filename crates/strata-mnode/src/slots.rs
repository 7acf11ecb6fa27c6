//! Per-vgroup table-slot allocator.
//!
//! A bitmap of taken slot ids plus a parallel array of the tables that
//! occupy them. A bit is set iff the slot holds a table or is reserved for
//! one; a reserved slot has its bit set and an empty array entry.

use strata_types::{SlotId, TableId, VGroupId};

use crate::error::{Result, VGroupError};

const WORD_BITS: usize = 64;

/// A table as seen by the vgroup layer: its id and the slot it was stamped
/// with, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    pub table_id: TableId,
    pub slot: Option<SlotId>,
}

impl TableRef {
    pub fn new(table_id: TableId, slot: Option<SlotId>) -> Self {
        Self { table_id, slot }
    }

    /// Builds a reference from a raw wire slot id (negative = none).
    pub fn from_raw(table_id: TableId, raw_slot: i32) -> Self {
        Self {
            table_id,
            slot: SlotId::from_raw(raw_slot),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSlots {
    bitmap: Vec<u64>,
    tables: Vec<Option<TableId>>,
    used: u32,
}

impl TableSlots {
    /// Allocates the allocator for `capacity` slots.
    ///
    /// Fails without side effects if the backing storage cannot be reserved.
    pub fn with_capacity(vg_id: VGroupId, capacity: u32) -> Result<Self> {
        let fail = || VGroupError::AllocationFailure { vg_id, capacity };
        if capacity == 0 {
            return Err(fail());
        }

        let slots = capacity as usize;
        let mut bitmap = Vec::new();
        bitmap.try_reserve_exact(words_for(slots)).map_err(|_| fail())?;
        bitmap.resize(words_for(slots), 0);

        let mut tables = Vec::new();
        tables.try_reserve_exact(slots).map_err(|_| fail())?;
        tables.resize(slots, None);

        Ok(Self {
            bitmap,
            tables,
            used: 0,
        })
    }

    pub fn capacity(&self) -> u32 {
        // `tables` never grows past a u32 capacity.
        u32::try_from(self.tables.len()).unwrap_or(u32::MAX)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> u32 {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_free(&self, slot: SlotId) -> bool {
        let idx = slot.as_usize();
        idx < self.tables.len() && !self.bit(idx)
    }

    /// Table occupying `slot`, if any.
    pub fn table_at(&self, slot: SlotId) -> Option<TableId> {
        self.tables.get(slot.as_usize()).copied().flatten()
    }

    pub fn is_reserved(&self, slot: SlotId) -> bool {
        let idx = slot.as_usize();
        idx < self.tables.len() && self.bit(idx) && self.tables[idx].is_none()
    }

    /// Marks `slot` occupied by `table`, consuming a reservation on it.
    /// Returns false if the slot is out of range or already holds a table.
    pub fn occupy(&mut self, slot: SlotId, table: TableId) -> bool {
        let idx = slot.as_usize();
        if self.tables.get(idx).is_none_or(Option::is_some) {
            return false;
        }
        self.set_bit(idx, true);
        self.tables[idx] = Some(table);
        self.used += 1;
        true
    }

    /// Frees `slot`. Returns the table that held it.
    pub fn release(&mut self, slot: SlotId) -> Option<TableId> {
        let idx = slot.as_usize();
        let table = self.tables.get_mut(idx)?.take()?;
        self.set_bit(idx, false);
        self.used -= 1;
        Some(table)
    }

    /// Takes the lowest free slot id without a table in it yet.
    pub fn reserve(&mut self) -> Option<SlotId> {
        let slot = self.lowest_free()?;
        self.set_bit(slot.as_usize(), true);
        Some(slot)
    }

    /// Gives back a reservation that was never filled.
    pub fn cancel_reservation(&mut self, slot: SlotId) -> bool {
        if !self.is_reserved(slot) {
            return false;
        }
        self.set_bit(slot.as_usize(), false);
        true
    }

    /// Lowest free slot id, without occupying it.
    pub fn lowest_free(&self) -> Option<SlotId> {
        let cap = self.tables.len();
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(w, word)| w * WORD_BITS + word.trailing_ones() as usize)
            .filter(|idx| *idx < cap)
            .and_then(|idx| u32::try_from(idx).ok())
            .map(SlotId::new)
    }

    /// Resizes to `new_capacity`, keeping every allocation and reservation
    /// whose id is below both the old and new capacity. Returns how many
    /// allocations were cut off.
    pub fn resize(&mut self, vg_id: VGroupId, new_capacity: u32) -> Result<u32> {
        let mut next = Self::with_capacity(vg_id, new_capacity)?;
        let keep = self.tables.len().min(next.tables.len());
        let mut dropped = 0;
        for (idx, table) in self.tables.iter().enumerate() {
            let Some(table) = table else {
                if idx < keep && self.bit(idx) {
                    next.set_bit(idx, true);
                }
                continue;
            };
            if idx < keep {
                next.set_bit(idx, true);
                next.tables[idx] = Some(*table);
                next.used += 1;
            } else {
                dropped += 1;
            }
        }
        *self = next;
        Ok(dropped)
    }

    fn bit(&self, idx: usize) -> bool {
        self.bitmap[idx / WORD_BITS] & (1 << (idx % WORD_BITS)) != 0
    }

    fn set_bit(&mut self, idx: usize, on: bool) {
        let mask = 1u64 << (idx % WORD_BITS);
        if on {
            self.bitmap[idx / WORD_BITS] |= mask;
        } else {
            self.bitmap[idx / WORD_BITS] &= !mask;
        }
    }
}

fn words_for(slots: usize) -> usize {
    slots.div_ceil(WORD_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VG: VGroupId = VGroupId::UNASSIGNED;

    fn slot(id: u32) -> SlotId {
        SlotId::new(id)
    }

    #[test]
    fn zero_capacity_is_an_allocation_failure() {
        assert_eq!(
            TableSlots::with_capacity(VG, 0),
            Err(VGroupError::AllocationFailure {
                vg_id: VG,
                capacity: 0
            })
        );
    }

    #[test]
    fn occupy_and_release() {
        let mut slots = TableSlots::with_capacity(VG, 4).unwrap();
        assert!(slots.occupy(slot(2), TableId::new(20)));
        assert!(!slots.occupy(slot(2), TableId::new(21)));
        assert!(!slots.occupy(slot(4), TableId::new(22)));
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.table_at(slot(2)), Some(TableId::new(20)));

        assert_eq!(slots.release(slot(2)), Some(TableId::new(20)));
        assert_eq!(slots.release(slot(2)), None);
        assert!(slots.is_empty());
    }

    #[test]
    fn lowest_free_skips_occupied_words() {
        let mut slots = TableSlots::with_capacity(VG, 70).unwrap();
        for id in 0..65 {
            assert!(slots.occupy(slot(id), TableId::new(u64::from(id))));
        }
        assert_eq!(slots.lowest_free(), Some(slot(65)));

        slots.release(slot(3));
        assert_eq!(slots.lowest_free(), Some(slot(3)));
    }

    #[test]
    fn reservations_hand_out_distinct_slots() {
        let mut slots = TableSlots::with_capacity(VG, 3).unwrap();
        assert_eq!(slots.reserve(), Some(slot(0)));
        assert_eq!(slots.reserve(), Some(slot(1)));
        assert!(slots.is_reserved(slot(0)));
        assert!(!slots.is_free(slot(0)));
        assert!(slots.is_empty());

        assert!(slots.occupy(slot(1), TableId::new(11)));
        assert!(!slots.is_reserved(slot(1)));
        assert!(!slots.cancel_reservation(slot(1)));
        assert_eq!(slots.len(), 1);

        assert!(slots.cancel_reservation(slot(0)));
        assert_eq!(slots.reserve(), Some(slot(0)));
        assert_eq!(slots.reserve(), Some(slot(2)));
        assert_eq!(slots.reserve(), None);
    }

    #[test]
    fn resize_keeps_low_reservations() {
        let mut slots = TableSlots::with_capacity(VG, 8).unwrap();
        slots.reserve();
        slots.occupy(slot(5), TableId::new(5));
        slots.resize(VG, 4).unwrap();
        assert!(slots.is_reserved(slot(0)));
        assert_eq!(slots.lowest_free(), Some(slot(1)));
    }

    #[test]
    fn full_allocator_has_no_free_slot() {
        let mut slots = TableSlots::with_capacity(VG, 2).unwrap();
        slots.occupy(slot(0), TableId::new(1));
        slots.occupy(slot(1), TableId::new(2));
        assert_eq!(slots.lowest_free(), None);
    }

    #[test]
    fn shrink_reports_cut_allocations() {
        let mut slots = TableSlots::with_capacity(VG, 8).unwrap();
        slots.occupy(slot(1), TableId::new(1));
        slots.occupy(slot(6), TableId::new(6));
        assert_eq!(slots.resize(VG, 4).unwrap(), 1);
        assert_eq!(slots.capacity(), 4);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.table_at(slot(1)), Some(TableId::new(1)));
    }

    proptest! {
        #[test]
        fn prop_resize_preserves_low_allocations(
            old_cap in 1u32..200,
            new_cap in 1u32..200,
            occupied in proptest::collection::btree_set(0u32..200, 0..50),
        ) {
            let mut slots = TableSlots::with_capacity(VG, old_cap).unwrap();
            for id in &occupied {
                slots.occupy(slot(*id), TableId::new(u64::from(*id)));
            }
            slots.resize(VG, new_cap).unwrap();

            let keep = old_cap.min(new_cap);
            for id in 0..new_cap {
                let expected = (id < keep && occupied.contains(&id)).then(|| TableId::new(u64::from(id)));
                prop_assert_eq!(slots.table_at(slot(id)), expected);
                prop_assert_eq!(slots.is_free(slot(id)), expected.is_none());
            }
            let kept = occupied.iter().filter(|id| **id < keep).count();
            prop_assert_eq!(slots.len() as usize, kept);
        }
    }
}
