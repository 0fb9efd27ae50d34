//! Instruction combining / fusion (`spec.md` §4.10).
//!
//! Pattern recognition is inherently per-ISA (the loop idioms named in the
//! spec are ARM opcodes), so it lives in each `Architecture`'s own
//! `to_be_translated`, invoked from its decode tail the same way the
//! original calls `ic->combination_check` there. This module supplies the
//! two pieces that are architecture-independent: the hook's type, and a
//! bounded host-memset helper a fused handler can call to apply many
//! iterations of a "store and increment" loop in one shot without
//! executing each iteration as a separate IC.

use crate::arch::Architecture;
use crate::machine::Machine;
use dyntrans_tc::PageId;

/// `ic->combination_check`: examined at the end of decoding a fresh IC
/// (never during single-step) to decide whether the last few ICs on the
/// page form a recognised idiom. Returns `true` if a fusion fired, in
/// which case the caller is responsible for setting `PageFlags::COMBINATIONS`
/// on the page.
pub type CombinerHook<A> = fn(&mut Machine<A>, page: PageId, ic_index: u32) -> bool;

/// Applies up to `max_host_pages` host pages' worth of a `memset`-shaped
/// loop starting at `dest_paddr`, returning the number of bytes actually
/// written. Bounded per call so a fused handler remains responsive to
/// interrupt/single-step requests between invocations, per `spec.md` §5's
/// "Cancellation" note on the combiner's long-running memsets.
pub fn bounded_memset<A: Architecture>(machine: &mut Machine<A>, dest_paddr: u64, byte: u8, count: u64, max_host_pages: u64) -> u64 {
    let page_size = A::page_size();
    let cap = max_host_pages.saturating_mul(page_size);
    let n = count.min(cap);
    let mut written = 0u64;
    while written < n {
        let paddr = dest_paddr + written;
        let host = match machine.bus.ram.paddr_to_hostaddr(paddr, true) {
            Some(h) => h,
            None => break,
        };
        let in_block_remaining = machine.bus.ram.block_size() as u64 - (paddr % machine.bus.ram.block_size() as u64);
        let chunk = in_block_remaining.min(n - written);
        unsafe { host.as_mut_slice(chunk as usize) }.fill(byte);
        written += chunk;
    }
    if written > 0 {
        let first_page = dest_paddr & !(page_size - 1);
        let last_page = (dest_paddr + written - 1) & !(page_size - 1);
        let mut p = first_page;
        while p <= last_page {
            crate::invalidate::invalidate_code_translation(machine, crate::invalidate::InvalidateTarget::Paddr(p), false);
            p += page_size;
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Architecture, TranslateFlags, TranslateOutcome};
    use dyntrans_tc::Operand;

    struct Flat;
    impl Architecture for Flat {
        type Regs = ();
        const IC_ENTRIES_PER_PAGE: usize = 16;
        const PAGE_SHIFT: u32 = 12;
        const HAS_DELAY_SLOT: bool = false;
        const ADDR_BITS: u32 = 32;
        const PC_TO_IC_SHIFT: u32 = 2;

        fn translate_address(_m: &mut Machine<Self>, vaddr: u64, _flags: TranslateFlags) -> TranslateOutcome {
            TranslateOutcome::Ok(vaddr)
        }
        fn to_be_translated(_m: &mut Machine<Self>, _args: [Operand; 3]) {}
        fn end_of_page(_m: &mut Machine<Self>, _args: [Operand; 3]) {}
    }

    #[test]
    fn bounded_memset_fills_requested_range_and_invalidates_code() {
        let mut m: Machine<Flat> = Machine::new(1 << 20, 1);
        m.cpu_mut().pc = 0x1000;
        crate::dispatch::pc_to_pointers(&mut m);
        assert!(m.tc.lookup(0x1000, 0x1000 >> 12).is_some());

        let written = bounded_memset(&mut m, 0x1000, 0xAB, 4000, 8);
        assert_eq!(written, 4000);
        let mut buf = [0u8; 4];
        crate::memory_rw::memory_rw(&mut m, 0x1000, &mut buf, false, crate::memory_rw::AccessFlags::default());
        assert_eq!(buf, [0xAB; 4]);
        // The page we just wrote code-translated memory into is unlinked.
        assert!(m.tc.lookup(0x1000, 0x1000 >> 12).is_none());
    }

    #[test]
    fn bounded_memset_respects_max_host_pages_cap() {
        let mut m: Machine<Flat> = Machine::new(1 << 20, 1);
        let written = bounded_memset(&mut m, 0x8000, 0x11, 1 << 20, 2);
        assert_eq!(written, 2 * Flat::page_size());
    }
}
