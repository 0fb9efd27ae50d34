//! The outer scheduler (`spec.md` §5, §5.2), grounded directly on the
//! original's `cpu_run` chunk loop: a fixed-size chunk of instructions per
//! CPU, tick-source servicing keyed off CPU 0's retired-instruction count,
//! and a periodic console flush.

use crate::arch::Architecture;
use crate::dispatch::cpu_run_instr;
use crate::machine::Machine;

/// Instructions per outer-scheduler chunk.
const CHUNK_SIZE: i64 = 16 * 1024;
/// Cycles between buffered console flushes.
const CONSOLE_FLUSH_INTERVAL: u64 = 1 << 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Run every CPU for a full chunk.
    Normal,
    /// Run for at most `max_instrs` this chunk, regardless of `CHUNK_SIZE`
    /// (used by fuzzing/differential-testing harnesses that want a bounded,
    /// reproducible amount of work per call).
    RandomBudget { max_instrs: i64 },
    /// Run exactly one instruction, on CPU 0 only (used by the debugger).
    SingleStep,
}

pub struct Scheduler {
    cycles_since_flush: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { cycles_since_flush: 0 }
    }

    /// Runs one chunk across all of `machine`'s CPUs and services tick
    /// sources. Returns `true` if a console flush is due.
    pub fn run_chunk<A: Architecture>(&mut self, machine: &mut Machine<A>, mode: RunMode) -> bool {
        let budget = match mode {
            RunMode::Normal => CHUNK_SIZE,
            RunMode::RandomBudget { max_instrs } => max_instrs.clamp(0, CHUNK_SIZE),
            RunMode::SingleStep => 1,
        };
        let ncpus = if mode == RunMode::SingleStep { 1 } else { machine.cpus.len() };
        // `RandomBudget` needs instruction-exact granularity to honour an
        // arbitrary cap, which only single-step dispatch (one IC per call)
        // can give; `Normal` runs the full unrolled-batch dispatch loop.
        let force_single_step = matches!(mode, RunMode::SingleStep | RunMode::RandomBudget { .. });

        let mut cpu0_instrs = 0i64;
        for cpu_idx in 0..ncpus {
            machine.current_cpu = cpu_idx;
            machine.cpu_mut().single_step = force_single_step;
            let mut remaining = budget;
            while remaining > 0 && machine.cpu().running {
                let n = cpu_run_instr(machine);
                if cpu_idx == 0 {
                    cpu0_instrs += n;
                }
                if n <= 0 {
                    break;
                }
                remaining -= n;
            }
        }
        machine.current_cpu = 0;

        service_tick_sources(machine, cpu0_instrs);
        machine.ncycles += cpu0_instrs.max(0) as u64;
        self.cycles_since_flush += cpu0_instrs.max(0) as u64;
        if self.cycles_since_flush >= CONSOLE_FLUSH_INTERVAL {
            self.cycles_since_flush = 0;
            true
        } else {
            false
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements every tick source by `cpu0_instrs / ipc` and fires any whose
/// counter reaches zero, reloading it from `reset_value`. The firing
/// closure is swapped out of the `Vec` for the duration of the call (it
/// needs `&mut Machine<A>`, which already contains the `Vec` it lives in)
/// and swapped back afterwards, the same "take it out, call it, put it
/// back" discipline the IC dispatch loop uses for instruction handlers.
fn service_tick_sources<A: Architecture>(machine: &mut Machine<A>, cpu0_instrs: i64) {
    for i in 0..machine.tick_sources.len() {
        let ipc = machine.tick_sources[i].ipc;
        machine.tick_sources[i].ticks_till_next -= cpu0_instrs / ipc;
        if machine.tick_sources[i].ticks_till_next <= 0 {
            let reset = machine.tick_sources[i].reset_value;
            let mut fire = std::mem::replace(&mut machine.tick_sources[i].fire, Box::new(|_: &mut Machine<A>| {}));
            fire(machine);
            machine.tick_sources[i].fire = fire;
            machine.tick_sources[i].ticks_till_next = reset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{TranslateFlags, TranslateOutcome};
    use crate::machine::TickSource;
    use dyntrans_tc::Operand;

    struct Counter;
    impl Architecture for Counter {
        type Regs = [u64; 1];
        const IC_ENTRIES_PER_PAGE: usize = 64;
        const PAGE_SHIFT: u32 = 12;
        const HAS_DELAY_SLOT: bool = false;
        const ADDR_BITS: u32 = 32;
        const PC_TO_IC_SHIFT: u32 = 2;

        fn translate_address(_m: &mut Machine<Self>, vaddr: u64, _flags: TranslateFlags) -> TranslateOutcome {
            TranslateOutcome::Ok(vaddr)
        }
        fn to_be_translated(machine: &mut Machine<Self>, _args: [Operand; 3]) {
            let page = machine.cpu().cur_page.unwrap();
            let slot = (machine.cpu().next_ic - 1) as usize;
            machine.tc.page_mut(page).ic_entries_mut()[slot] = dyntrans_tc::InstrCall::new(bump, [Operand::None; 3]);
            bump(machine, [Operand::None; 3]);
        }
        fn end_of_page(machine: &mut Machine<Self>, _args: [Operand; 3]) {
            machine.cpu_mut().running = false;
        }
    }

    fn bump(machine: &mut Machine<Counter>, _args: [Operand; 3]) {
        machine.cpu_mut().regs[0] += 1;
    }

    #[test]
    fn single_step_mode_runs_exactly_one_instruction_on_cpu0() {
        let mut m: Machine<Counter> = Machine::new(1 << 20, 2);
        let mut sched = Scheduler::new();
        sched.run_chunk(&mut m, RunMode::SingleStep);
        assert_eq!(m.cpus[0].regs[0], 1);
        assert_eq!(m.cpus[1].regs[0], 0);
    }

    #[test]
    fn random_budget_caps_instructions_below_chunk_size() {
        let mut m: Machine<Counter> = Machine::new(1 << 20, 1);
        let mut sched = Scheduler::new();
        sched.run_chunk(&mut m, RunMode::RandomBudget { max_instrs: 10 });
        assert_eq!(m.cpus[0].regs[0], 10);
    }

    #[test]
    fn tick_source_fires_and_reloads_after_enough_instructions() {
        let mut m: Machine<Counter> = Machine::new(1 << 20, 1);
        let fired = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let fired_clone = fired.clone();
        m.add_tick_source(TickSource::new(
            "test-timer",
            5,
            1,
            Box::new(move |_m: &mut Machine<Counter>| {
                fired_clone.set(fired_clone.get() + 1);
            }),
        ));
        let mut sched = Scheduler::new();
        sched.run_chunk(&mut m, RunMode::RandomBudget { max_instrs: 12 });
        // Tick sources are serviced once per chunk, not once per
        // instruction: 12 retired instructions against a reset value of 5
        // only fires once per chunk, with the remainder carried over as
        // drift (matching the original's single decrement-and-check).
        assert_eq!(fired.get(), 1);
        assert_eq!(m.tick_sources[0].ticks_till_next, 5);
    }
}
