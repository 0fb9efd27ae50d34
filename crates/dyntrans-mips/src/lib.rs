//! A MIPS-like [`Architecture`] implementation: an exemplar ISA front end
//! built on a small MIPS-I subset (`decode`, `exec`) big enough to carry
//! end-to-end scenarios (simple sequences, cross-page branches,
//! self-modifying code, the store/decrement/branch combiner idiom) without
//! pulling in a full ISA.
//!
//! This crate deliberately does not model a real MMU: `translate_address`
//! is the identity mapping (`vaddr == paddr`). A software-walked page table
//! is a per-ISA detail outside the engine's shared core; every dyntrans
//! mechanism that depends on the *translator* succeeding or failing (TLB
//! fills, invalidation, device aliasing) is still exercised in full, since
//! none of it depends on the MMU being anything more than an identity map.

pub mod combine;
pub mod decode;
pub mod exec;
pub mod regs;

pub use regs::MipsRegs;

use dyntrans_core::{Architecture, Machine, TranslateFlags, TranslateOutcome};
use dyntrans_tc::Operand;

/// The `Architecture` marker type. Carries no state of its own; all mutable
/// state lives in `Cpu<Mips>`/`Machine<Mips>`.
pub struct Mips;

impl Architecture for Mips {
    type Regs = MipsRegs;

    // 4 KiB pages, 4-byte fixed-length encoding -> 1024 ordinary IC slots.
    const IC_ENTRIES_PER_PAGE: usize = 1024;
    const PAGE_SHIFT: u32 = 12;
    const HAS_DELAY_SLOT: bool = true;
    const ADDR_BITS: u32 = 32;
    const PC_TO_IC_SHIFT: u32 = 2;

    /// No software-walked guest MMU in this exemplar: every virtual address
    /// is its own physical address. Real MIPS front ends replace this with
    /// a TLB/BAT walk that raises TLBL/TLBS/ADEL on miss; the dyntrans
    /// engine itself does not care which, since it only ever consumes the
    /// `(ok, paddr)` outcome.
    fn translate_address(_machine: &mut Machine<Self>, vaddr: u64, _flags: TranslateFlags) -> TranslateOutcome {
        TranslateOutcome::Ok(vaddr)
    }

    fn to_be_translated(machine: &mut Machine<Self>, args: [Operand; 3]) {
        exec::to_be_translated(machine, args);
    }

    fn end_of_page(machine: &mut Machine<Self>, args: [Operand; 3]) {
        exec::end_of_page(machine, args);
    }

    fn end_of_page2() -> Option<dyntrans_tc::Handler<Machine<Self>>> {
        Some(exec::end_of_page2)
    }

    fn nothing_call(machine: &mut Machine<Self>, _args: [Operand; 3]) {
        machine.cpu_mut().running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dyntrans_core::{cpu_run_instr, memory_rw, pc_to_pointers, AccessFlags};

    fn word_addiu(rt: u32, rs: u32, imm: u16) -> u32 {
        (0x09 << 26) | (rs << 21) | (rt << 16) | imm as u32
    }
    fn word_add(rd: u32, rs: u32, rt: u32) -> u32 {
        (rs << 21) | (rt << 16) | (rd << 11) | 0x20
    }
    fn word_beq(rs: u32, rt: u32, offset: i16) -> u32 {
        (0x04 << 26) | (rs << 21) | (rt << 16) | (offset as u16) as u32
    }

    fn install(machine: &mut Machine<Mips>, base: u64, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            let mut buf = w.to_le_bytes();
            assert!(memory_rw(machine, base + (i as u64) * 4, &mut buf, true, AccessFlags::default()));
        }
    }

    /// A simple straight-line sequence ending in a branch-to-self.
    #[test]
    fn simple_sequence_matches_spec_scenario_one() {
        let mut machine: Machine<Mips> = Machine::new(1 << 20, 1);
        install(
            &mut machine,
            0x1000,
            &[
                word_addiu(1, 0, 5),       // addiu r1, r0, 5
                word_addiu(2, 0, 7),       // addiu r2, r0, 7
                word_add(3, 1, 2),         // add r3, r1, r2
                word_beq(0, 0, -1i16),     // b . (beq r0, r0, -1 -> branches to itself)
                word_addiu(4, 0, 0xFFFF),  // delay slot instruction (harmless filler)
            ],
        );
        machine.cpu_mut().pc = 0x1000;
        machine.cpu_mut().single_step = true;
        for _ in 0..5 {
            cpu_run_instr(&mut machine);
        }
        assert_eq!(machine.cpu().regs.get(1), 5);
        assert_eq!(machine.cpu().regs.get(2), 7);
        assert_eq!(machine.cpu().regs.get(3), 12);
        // The branch-to-self keeps resolving to the same instruction once
        // its delay slot has executed.
        assert_eq!(machine.cpu().pc, 0x100c);
    }

    /// A store to a code page invalidates its translation; the next fetch
    /// observes the new word.
    #[test]
    fn self_modifying_code_observes_the_new_instruction() {
        let mut machine: Machine<Mips> = Machine::new(1 << 20, 1);
        // ori r1, r1, 0 initially (no-op), then rewritten to ori r1, r1, 1.
        install(&mut machine, 0x2000, &[0x3421_0000]);
        machine.cpu_mut().pc = 0x2000;
        machine.cpu_mut().regs.set(1, 0);
        machine.cpu_mut().single_step = true;
        cpu_run_instr(&mut machine);
        assert_eq!(machine.cpu().regs.get(1), 0);

        // Patch the low bit of the immediate in place (0x34210001 == ori r1,r1,1).
        let mut patched = 0x3421_0001u32.to_le_bytes();
        assert!(memory_rw(&mut machine, 0x2000, &mut patched, true, AccessFlags::default()));

        machine.cpu_mut().pc = 0x2000;
        machine.cpu_mut().invalidate_pointers();
        cpu_run_instr(&mut machine);
        assert_eq!(machine.cpu().regs.get(1), 1);
    }

    /// A branch whose target is on another page installs the generic
    /// handler; the delay-slot sentinel rolls over into a freshly allocated
    /// page.
    #[test]
    fn cross_page_branch_allocates_target_page_and_keeps_running() {
        let mut machine: Machine<Mips> = Machine::new(1 << 20, 1);
        // At the very start of page A (0x1000), jump to the start of page B
        // (0x2000); its delay slot (addiu) lives right after it.
        install(
            &mut machine,
            0x1000,
            &[
                word_beq(0, 0, ((0x2000i64 - 0x1004) / 4) as i16), // beq r0,r0, -> 0x2000
                word_addiu(5, 0, 42), // delay slot
            ],
        );
        install(&mut machine, 0x2000, &[word_addiu(6, 0, 99)]);

        machine.cpu_mut().pc = 0x1000;
        machine.cpu_mut().single_step = true;
        for _ in 0..3 {
            cpu_run_instr(&mut machine);
        }
        assert_eq!(machine.cpu().regs.get(5), 42);
        assert_eq!(machine.cpu().regs.get(6), 99);
        assert!(machine.tc.lookup(0x2000, 0x2000 >> 12).is_some());
    }
}
