//! Invalidation (`spec.md` §4.9): the three orthogonal targets (vaddr,
//! paddr, all) crossed with drop-vs-downgrade, implemented on top of the
//! per-CPU [`crate::tlb::Tlb`] and the shared [`dyntrans_tc::TranslationCache`].

use crate::arch::Architecture;
use crate::machine::Machine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidateTarget {
    /// Clear only the fast-array entry for this virtual page; the victim
    /// table entry is left to be naturally replaced.
    Vaddr(u64),
    /// Scan the victim table for entries mapping this physical page.
    Paddr(u64),
    /// Scan the victim table unconditionally.
    All,
    /// PowerPC-style: scan the victim table, but only entries whose top 4
    /// virtual-address bits equal this value.
    AllUpper4(u8),
}

/// Invalidates a data or code mapping. `mark_non_writable_only` selects the
/// "downgrade to read-only" mode (used when a device aliases a RAM page)
/// over dropping the mapping outright.
///
/// Code invalidation additionally drops the PPTR from the translation
/// cache's hash chain when `target` names a physical page that has ever
/// been used for a code translation (tracked by the per-CPU
/// `phystranslation` set), the "unlink rather than patch ICs" strategy
/// `spec.md` §4.9/§9 calls out as the simpler, acceptable alternative.
pub fn invalidate_code_translation<A: Architecture>(machine: &mut Machine<A>, target: InvalidateTarget, mark_non_writable_only: bool) {
    let page_shift = A::PAGE_SHIFT;
    match target {
        InvalidateTarget::Vaddr(vaddr_page) => {
            machine.cpu_mut().tlb.invalidate_vaddr(vaddr_page, page_shift);
        }
        InvalidateTarget::Paddr(paddr_page) => {
            machine.cpu_mut().tlb.invalidate_paddr(paddr_page, page_shift, mark_non_writable_only);
            if !mark_non_writable_only && machine.cpu().tlb.has_phys_translation(paddr_page) {
                let pagenr = paddr_page >> page_shift;
                machine.tc.unlink(paddr_page, pagenr);
                machine.cpu_mut().tlb.clear_phys_translation(paddr_page);
            }
        }
        InvalidateTarget::All => {
            machine.cpu_mut().tlb.invalidate_all(None, page_shift);
        }
        InvalidateTarget::AllUpper4(top) => {
            machine.cpu_mut().tlb.invalidate_all(Some(top), page_shift);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Architecture, TranslateFlags, TranslateOutcome};
    use crate::memory_rw::{memory_rw, AccessFlags};
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
    fn paddr_invalidate_drops_tlb_entry_and_unlinks_pptr() {
        let mut m: Machine<Flat> = Machine::new(1 << 20, 1);
        // Fetch from 0x3000 to populate both the TLB code entry and the PPTR.
        m.cpu_mut().pc = 0x3000;
        crate::dispatch::pc_to_pointers(&mut m);
        assert!(m.cpu().tlb.has_phys_translation(0x3000));
        assert!(m.tc.lookup(0x3000, 0x3000 >> 12).is_some());

        invalidate_code_translation(&mut m, InvalidateTarget::Paddr(0x3000), false);
        assert!(!m.cpu().tlb.has_phys_translation(0x3000));
        assert!(m.tc.lookup(0x3000, 0x3000 >> 12).is_none());
        assert!(m.cpu().tlb.fast_lookup(0x3000 >> 12).phys_page.is_none());
    }

    #[test]
    fn write_to_ram_invalidates_its_own_code_translation() {
        let mut m: Machine<Flat> = Machine::new(1 << 20, 1);
        m.cpu_mut().pc = 0x4000;
        crate::dispatch::pc_to_pointers(&mut m);
        assert!(m.tc.lookup(0x4000, 0x4000 >> 12).is_some());

        let mut data = [0x01u8];
        assert!(memory_rw(&mut m, 0x4000, &mut data, true, AccessFlags::default()));
        assert!(m.tc.lookup(0x4000, 0x4000 >> 12).is_none());
    }
}
