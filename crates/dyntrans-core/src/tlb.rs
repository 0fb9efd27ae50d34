//! The victim-table half of the per-CPU TLB, wrapping a [`PagePointerTable`]
//! with the bounded array of full translation records it points into, plus
//! the sparse "has this physical page ever been the target of a code
//! translation" bitmap used to short-circuit invalidation scans.

use std::collections::HashSet;

use bitflags::bitflags;
use dyntrans_mem::HostPtr;

use crate::pagetable::{FastSlot, FlatPageTable, PagePointerTable, RadixPageTable};

/// One full translation record. The fast array only ever points at one of
/// these by index; eviction and invalidation walk this array directly.
#[derive(Clone, Copy)]
pub struct VphEntry {
    pub valid: bool,
    pub write_ok: bool,
    pub is_code: bool,
    pub vaddr_page: u64,
    pub paddr_page: u64,
    pub host_page: Option<HostPtr>,
    pub timestamp: u64,
}

impl Default for VphEntry {
    fn default() -> Self {
        Self { valid: false, write_ok: false, is_code: false, vaddr_page: 0, paddr_page: 0, host_page: None, timestamp: 0 }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct UpdateFlags: u8 {
        const WRITE      = 1 << 0;
        const DOWNGRADE  = 1 << 1;
        const CODE       = 1 << 2;
    }
}

/// Separates the data half from the code half of the victim array, and
/// picks a replacement policy: round-robin for 32-bit guests (matching the
/// original's cheap cursor), oldest-timestamp for 64-bit ones where the
/// working set is sparser and a smarter policy pays for itself.
enum Eviction {
    RoundRobin { next_data: usize, next_code: usize },
    OldestTimestamp,
}

pub struct Tlb {
    table: Box<dyn PagePointerTable>,
    victims: Vec<VphEntry>,
    half: usize,
    eviction: Eviction,
    clock: u64,
    phys_translation: HashSet<u64>,
}

impl Tlb {
    pub fn new_flat(vpn_bits: u32, victim_entries: usize, round_robin: bool) -> Self {
        Self::new(Box::new(FlatPageTable::new(vpn_bits)), victim_entries, round_robin)
    }

    pub fn new_radix(level_bits: [u32; 3], victim_entries: usize, round_robin: bool) -> Self {
        Self::new(Box::new(RadixPageTable::new(level_bits)), victim_entries, round_robin)
    }

    fn new(table: Box<dyn PagePointerTable>, victim_entries: usize, round_robin: bool) -> Self {
        assert!(victim_entries >= 2 && victim_entries % 2 == 0, "victim table must split evenly into data/code halves");
        let half = victim_entries / 2;
        let eviction = if round_robin {
            Eviction::RoundRobin { next_data: 0, next_code: half }
        } else {
            Eviction::OldestTimestamp
        };
        Self {
            table,
            victims: vec![VphEntry::default(); victim_entries],
            half,
            eviction,
            clock: 0,
            phys_translation: HashSet::new(),
        }
    }

    pub fn fast_lookup(&self, pagenr: u64) -> FastSlot {
        self.table.get(pagenr)
    }

    fn bump_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn half_range(&self, code: bool) -> (usize, usize) {
        if code {
            (self.half, self.victims.len())
        } else {
            (0, self.half)
        }
    }

    fn pick_victim(&mut self, code: bool) -> usize {
        let (start, end) = self.half_range(code);
        match &mut self.eviction {
            Eviction::RoundRobin { next_data, next_code } => {
                let cursor = if code { next_code } else { next_data };
                let idx = *cursor;
                *cursor = if idx + 1 >= end { start } else { idx + 1 };
                idx
            }
            Eviction::OldestTimestamp => {
                let mut best = start;
                for i in start..end {
                    if !self.victims[i].valid {
                        return i;
                    }
                    if self.victims[i].timestamp < self.victims[best].timestamp {
                        best = i;
                    }
                }
                best
            }
        }
    }

    fn install_at(&mut self, idx: usize, vaddr_page: u64, host_page: HostPtr, paddr_page: u64, flags: UpdateFlags, page_shift: u32) {
        let write_ok = flags.contains(UpdateFlags::WRITE);
        let timestamp = self.bump_clock();
        self.victims[idx] = VphEntry {
            valid: true,
            write_ok,
            is_code: flags.contains(UpdateFlags::CODE),
            vaddr_page,
            paddr_page,
            host_page: Some(host_page),
            timestamp,
        };
        let pagenr = vaddr_page >> page_shift;
        let slot = self.table.get_mut(pagenr);
        slot.host_load = Some(host_page);
        slot.host_store = if write_ok { Some(host_page) } else { None };
        slot.phys_addr = Some(paddr_page);
        slot.phys_page = None;
        slot.vph_index = Some(idx as u32);
    }

    /// `update_translation_table` (`spec.md` §4.8): install or upgrade a
    /// TLB mapping for `vaddr_page`. Evicts the oldest same-kind (data/code)
    /// entry when no existing mapping can be reused, clearing that entry's
    /// old fast-array slot first so a stale `vph_index` never survives.
    pub fn update_translation_table(&mut self, vaddr_page: u64, host_page: HostPtr, paddr_page: u64, flags: UpdateFlags, page_shift: u32) {
        let code = flags.contains(UpdateFlags::CODE);
        let pagenr = vaddr_page >> page_shift;
        let existing = self.table.get(pagenr).vph_index.map(|i| i as usize);

        if let Some(idx) = existing {
            if self.victims[idx].valid && self.victims[idx].paddr_page == paddr_page {
                if flags.contains(UpdateFlags::WRITE) {
                    self.victims[idx].write_ok = true;
                    self.table.get_mut(pagenr).host_store = Some(host_page);
                } else if flags.contains(UpdateFlags::DOWNGRADE) {
                    self.victims[idx].write_ok = false;
                    self.table.get_mut(pagenr).host_store = None;
                }
                self.victims[idx].timestamp = self.bump_clock();
                return;
            }
            self.install_at(idx, vaddr_page, host_page, paddr_page, flags, page_shift);
            return;
        }

        let idx = self.pick_victim(code);
        if self.victims[idx].valid {
            let old_pagenr = self.victims[idx].vaddr_page >> page_shift;
            self.table.clear(old_pagenr);
        }
        self.install_at(idx, vaddr_page, host_page, paddr_page, flags, page_shift);
    }

    /// Installs a PPTR pointer directly into the fast array without a
    /// victim-table entry, for `pc_to_pointers`' `phys_page` field.
    pub fn install_phys_page(&mut self, vaddr_page: u64, page_shift: u32, page: dyntrans_tc::PageId) {
        let pagenr = vaddr_page >> page_shift;
        self.table.get_mut(pagenr).phys_page = Some(page);
    }

    pub fn clear_phys_page(&mut self, vaddr_page: u64, page_shift: u32) {
        let pagenr = vaddr_page >> page_shift;
        self.table.get_mut(pagenr).phys_page = None;
    }

    /// `INVALIDATE_VADDR` (`spec.md` §4.9): drop the fast-array entry only;
    /// the victim-table record is left behind (it gets garbage-collected
    /// the next time it's selected for eviction) since nothing but the fast
    /// array is addressed by `vaddr_page` alone.
    pub fn invalidate_vaddr(&mut self, vaddr_page: u64, page_shift: u32) {
        self.table.clear(vaddr_page >> page_shift);
    }

    /// `INVALIDATE_PADDR` (`spec.md` §4.9): scan the victim table for every
    /// entry mapping this physical page and either downgrade it to
    /// read-only (`mark_non_writable_only`, used when a device aliases a
    /// RAM page) or drop it outright (used on a genuine code-invalidating
    /// write).
    pub fn invalidate_paddr(&mut self, paddr_page: u64, page_shift: u32, mark_non_writable_only: bool) {
        for idx in 0..self.victims.len() {
            if !self.victims[idx].valid || self.victims[idx].paddr_page != paddr_page {
                continue;
            }
            let pagenr = self.victims[idx].vaddr_page >> page_shift;
            if mark_non_writable_only {
                self.victims[idx].write_ok = false;
                self.table.get_mut(pagenr).host_store = None;
            } else {
                self.table.clear(pagenr);
                self.victims[idx].valid = false;
            }
        }
    }

    /// `INVALIDATE_ALL` (`spec.md` §4.9): drop every entry, or (PowerPC
    /// segment registers) only those whose top 4 virtual-address bits match
    /// `upper4_filter`.
    pub fn invalidate_all(&mut self, upper4_filter: Option<u8>, page_shift: u32) {
        for idx in 0..self.victims.len() {
            if !self.victims[idx].valid {
                continue;
            }
            let matches = match upper4_filter {
                None => true,
                Some(top) => ((self.victims[idx].vaddr_page >> 28) as u8 & 0xF) == top,
            };
            if matches {
                let pagenr = self.victims[idx].vaddr_page >> page_shift;
                self.table.clear(pagenr);
                self.victims[idx].valid = false;
            }
        }
    }

    pub fn clear_all_fast_entries(&mut self) {
        self.table.clear_all();
    }

    pub fn mark_phys_translation(&mut self, paddr_page: u64) {
        self.phys_translation.insert(paddr_page);
    }

    pub fn has_phys_translation(&self, paddr_page: u64) -> bool {
        self.phys_translation.contains(&paddr_page)
    }

    pub fn clear_phys_translation(&mut self, paddr_page: u64) {
        self.phys_translation.remove(&paddr_page);
    }

    pub fn clear_all_phys_translation(&mut self) {
        self.phys_translation.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    fn fake_host_ptr() -> HostPtr {
        static BYTE: u8 = 0;
        unsafe { HostPtr::new(NonNull::new((&BYTE as *const u8) as *mut u8).unwrap()) }
    }

    #[test]
    fn install_then_fast_lookup_round_trips() {
        let mut tlb = Tlb::new_flat(8, 4, true);
        tlb.update_translation_table(0x1000, fake_host_ptr(), 0x9000, UpdateFlags::WRITE, 12);
        let slot = tlb.fast_lookup(0x1000 >> 12);
        assert_eq!(slot.phys_addr, Some(0x9000));
        assert!(slot.host_store.is_some());
    }

    #[test]
    fn downgrade_clears_store_but_keeps_load() {
        let mut tlb = Tlb::new_flat(8, 4, true);
        tlb.update_translation_table(0x1000, fake_host_ptr(), 0x9000, UpdateFlags::WRITE, 12);
        tlb.update_translation_table(0x1000, fake_host_ptr(), 0x9000, UpdateFlags::DOWNGRADE, 12);
        let slot = tlb.fast_lookup(0x1000 >> 12);
        assert!(slot.host_load.is_some());
        assert!(slot.host_store.is_none());
    }

    #[test]
    fn round_robin_eviction_clears_evicted_fast_slot() {
        let mut tlb = Tlb::new_flat(8, 2, true); // half = 1: one data slot
        tlb.update_translation_table(0x1000, fake_host_ptr(), 0x9000, UpdateFlags::empty(), 12);
        tlb.update_translation_table(0x2000, fake_host_ptr(), 0xA000, UpdateFlags::empty(), 12);
        assert!(tlb.fast_lookup(0x1000 >> 12).phys_addr.is_none());
        assert_eq!(tlb.fast_lookup(0x2000 >> 12).phys_addr, Some(0xA000));
    }

    #[test]
    fn invalidate_paddr_downgrade_leaves_entry_valid() {
        let mut tlb = Tlb::new_flat(8, 4, true);
        tlb.update_translation_table(0x1000, fake_host_ptr(), 0x9000, UpdateFlags::WRITE, 12);
        tlb.invalidate_paddr(0x9000, 12, true);
        let slot = tlb.fast_lookup(0x1000 >> 12);
        assert!(slot.host_load.is_some());
        assert!(slot.host_store.is_none());
    }

    #[test]
    fn invalidate_paddr_drop_clears_fast_slot_entirely() {
        let mut tlb = Tlb::new_flat(8, 4, true);
        tlb.update_translation_table(0x1000, fake_host_ptr(), 0x9000, UpdateFlags::WRITE, 12);
        tlb.invalidate_paddr(0x9000, 12, false);
        assert!(tlb.fast_lookup(0x1000 >> 12).phys_addr.is_none());
    }

    #[test]
    fn invalidate_all_respects_upper4_filter() {
        let mut tlb = Tlb::new_flat(16, 4, true);
        tlb.update_translation_table(0x1000_0000, fake_host_ptr(), 0x9000, UpdateFlags::empty(), 12);
        tlb.update_translation_table(0x2000_0000, fake_host_ptr(), 0xA000, UpdateFlags::empty(), 12);
        tlb.invalidate_all(Some(1), 12);
        assert!(tlb.fast_lookup(0x1000_0000 >> 12).phys_addr.is_none());
        assert_eq!(tlb.fast_lookup(0x2000_0000 >> 12).phys_addr, Some(0xA000));
    }
}
