//! The per-ISA contract the engine is generic over (`spec.md` §6).
//!
//! The original generates one copy of the dyntrans engine per ISA via
//! preprocessor macros (`DYNTRANS_ARCH`, `DYNTRANS_IC_ENTRIES_PER_PAGE`,
//! ...). `spec.md` §9 asks for a type-safe replacement; this trait plus
//! `Machine<A>`'s generic parameter is that replacement: the engine in
//! this crate is written once and instantiated per ISA.

use crate::machine::Machine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Flags passed to [`Architecture::translate_address`] (`spec.md` §6).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TranslateFlags {
    pub write: bool,
    pub instr: bool,
    pub no_exceptions: bool,
    pub user: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslateOutcome {
    Ok(u64),
    /// Translation failed; if `!flags.no_exceptions` the architecture has
    /// already vectored the CPU's PC to its fault handler.
    Failed,
}

/// Per-architecture plug-in point. `A` carries no runtime state of its own
/// (all mutable state lives in [`Machine<A>`]/`Cpu<A>`); it exists purely
/// to select compile-time layout constants and the MMU/decoder entry
/// points, the same role the original's `#ifdef DYNTRANS_MIPS` family of
/// macros plays.
pub trait Architecture: Sized + 'static {
    /// Architecture-specific register file (general-purpose registers,
    /// flags, segment state, ...). The universal shell (`pc`,
    /// `delay_slot`, TLB, ...) lives on [`crate::cpu::Cpu`] and is common
    /// to every ISA.
    type Regs: Default;

    /// `IC_ENTRIES_PER_PAGE`: number of ordinary (non-sentinel) IC slots
    /// per translated page.
    const IC_ENTRIES_PER_PAGE: usize;

    /// log2 of the guest page size in bytes (4 KiB pages: 12; Alpha's
    /// 8 KiB pages: 13).
    const PAGE_SHIFT: u32;

    /// True for architectures with a branch delay slot (MIPS, SPARC,
    /// M88K); selects the `end_of_page2` sentinel and cross-page
    /// delay-slot handling (`spec.md` §3, §4.7).
    const HAS_DELAY_SLOT: bool;

    /// 32 or 64: selects the flat vs. radix page-pointer table layout
    /// (`spec.md` §3 "Per-CPU TLB").
    const ADDR_BITS: u32;

    /// log2 of the minimum instruction encoding granularity used to map a
    /// PC into an IC-array slot (`PC_TO_IC_ENTRY`): 2 for fixed 4-byte
    /// RISC words, 0 for byte-granular ISAs like x86.
    const PC_TO_IC_SHIFT: u32;

    fn page_size() -> u64 {
        1u64 << Self::PAGE_SHIFT
    }

    fn sentinel_slots() -> usize {
        if Self::HAS_DELAY_SLOT {
            2
        } else {
            1
        }
    }

    /// `cpu->translate_address` (`spec.md` §6): guest MMU lookup. Must
    /// raise the architectural exception (writing `machine`'s current
    /// CPU's `pc`/fault state) on failure unless `flags.no_exceptions`.
    fn translate_address(machine: &mut Machine<Self>, vaddr: u64, flags: TranslateFlags) -> TranslateOutcome;

    /// `to_be_translated` (`spec.md` §4.7): decodes the guest instruction
    /// word(s) at `cpu.pc` and installs the resulting IC(s) into the
    /// current page, then returns the handler that should run *right now*
    /// for this slot (the original tail-calls the newly installed
    /// handler; we return it so the sentinel's own trampoline can invoke
    /// it without re-borrowing the page).
    fn to_be_translated(machine: &mut Machine<Self>, args: [dyntrans_tc::Operand; 3]);

    /// `end_of_page` (`spec.md` §3, §4.6): advances `pc` to the next page
    /// and re-resolves pointers.
    fn end_of_page(machine: &mut Machine<Self>, args: [dyntrans_tc::Operand; 3]);

    /// `end_of_page2` (`spec.md` §3): executes the delay-slot instruction
    /// that lives on the page following a branch, then rolls over.
    /// `None` for architectures without delay slots.
    fn end_of_page2() -> Option<dyntrans_tc::Handler<Machine<Self>>> {
        None
    }

    /// `nothing_call` (`spec.md` §4.7 step 9, §7): installed in place of a
    /// slot that failed to decode; does nothing (the CPU is halted by the
    /// caller).
    fn nothing_call(_machine: &mut Machine<Self>, _args: [dyntrans_tc::Operand; 3]) {}
}
