//! Per-CPU state common to every architecture: registers live on
//! `A::Regs`, everything dyntrans needs to keep an IC dispatch loop going
//! lives here (`spec.md` §3 "Per-CPU state").

use dyntrans_tc::PageId;

use crate::arch::{Architecture, ByteOrder};
use crate::tlb::Tlb;

/// Where execution currently stands relative to a branch delay slot, for
/// architectures where `Architecture::HAS_DELAY_SLOT` is true.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelaySlot {
    /// Not in a delay slot.
    None,
    /// The instruction about to execute is a delay slot, and the branch it
    /// follows has already computed `delayed_to`.
    Armed { delayed_to: u64 },
    /// The delay slot crosses into the next physical page; `end_of_page2`
    /// handles this case instead of jumping to `delayed_to` directly.
    Crosspage,
}

pub struct Breakpoints {
    addrs: Vec<u64>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self { addrs: Vec::new() }
    }

    pub fn add(&mut self, addr: u64) {
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }

    pub fn remove(&mut self, addr: u64) {
        self.addrs.retain(|&a| a != addr);
    }

    pub fn hits(&self, addr: u64) -> bool {
        self.addrs.contains(&addr)
    }
}

impl Default for Breakpoints {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Cpu<A: Architecture> {
    pub id: usize,
    pub regs: A::Regs,
    pub pc: u64,
    pub byte_order: ByteOrder,
    pub tlb: Tlb,

    /// The translation page the IC dispatch loop is currently executing
    /// out of, and the slot index of the next IC to run within it.
    pub cur_page: Option<PageId>,
    pub next_ic: u32,

    /// Running total of instructions dispatched; the outer scheduler
    /// (`spec.md` §5.2) subtracts chunks of this from tick-source counters.
    pub n_translated_instrs: i64,

    pub running: bool,
    /// Cleared by an IC handler to suspend the current dispatch batch early
    /// (exception raised, IRQ asserted, halted) without stopping the CPU
    /// outright; starts `true` and is restored by whatever next sets `pc`
    /// and re-enters `pc_to_pointers`.
    pub running_translated: bool,
    pub delay_slot: DelaySlot,
    pub in_crosspage_delayslot: bool,
    pub single_step: bool,
    pub breakpoints: Breakpoints,
}

impl<A: Architecture> Cpu<A> {
    pub fn new(id: usize, tlb: Tlb) -> Self {
        Self {
            id,
            regs: A::Regs::default(),
            pc: 0,
            byte_order: ByteOrder::Little,
            tlb,
            cur_page: None,
            next_ic: 0,
            n_translated_instrs: 0,
            running: true,
            running_translated: true,
            delay_slot: DelaySlot::None,
            in_crosspage_delayslot: false,
            single_step: false,
            breakpoints: Breakpoints::new(),
        }
    }

    /// Forces re-resolution of `cur_page`/`next_ic` on the next dispatch
    /// iteration (`spec.md` §4.5), used after a PC update whose target page
    /// isn't already known.
    pub fn invalidate_pointers(&mut self) {
        self.cur_page = None;
        self.next_ic = 0;
    }
}
