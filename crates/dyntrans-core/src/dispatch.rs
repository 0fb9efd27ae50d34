//! PC→pointer resolution and the inner dispatch loop (`spec.md` §4.5, §4.6).

use dyntrans_tc::PageId;

use crate::arch::{Architecture, TranslateFlags, TranslateOutcome};
use crate::machine::Machine;
use crate::tlb::UpdateFlags;

/// `pc_to_pointers`: resolves `cpu.pc` into `(cur_page, next_ic)`. Installs
/// a fresh translation page on first visit to a physical page, and caches
/// the `PageId` directly in the per-CPU TLB's fast array (`phys_page`) so
/// later visits take the fast path without touching the translation cache
/// at all.
pub fn pc_to_pointers<A: Architecture>(machine: &mut Machine<A>) {
    let pc = machine.cpu().pc;
    let page_shift = A::PAGE_SHIFT;
    let page_size = A::page_size();
    let vaddr_page = pc & !(page_size - 1);
    let pagenr = vaddr_page >> page_shift;

    if let Some(page_id) = machine.cpu().tlb.fast_lookup(pagenr).phys_page {
        set_cur_ic(machine, page_id, pc);
        return;
    }

    let cached_paddr = machine.cpu().tlb.fast_lookup(pagenr).phys_addr;
    let paddr = match cached_paddr {
        Some(p) => p,
        None => match translate_pc(machine, pc) {
            Some(p) => p,
            None => return,
        },
    };

    let paddr_page = paddr & !(page_size - 1);
    let dangerous = machine.bus.devices.page_is_dyntrans_dangerous(paddr_page, page_size);
    if !dangerous {
        if let Some(host_page) = machine.bus.ram.paddr_page_to_hostaddr(paddr_page, page_size, false) {
            machine.cpu_mut().tlb.update_translation_table(vaddr_page, host_page, paddr_page, UpdateFlags::CODE, page_shift);
        }
    }

    if machine.tc.should_reset() {
        machine.tc.reset();
    }
    let page_id = machine.tc.lookup_or_allocate(paddr_page, paddr_page >> page_shift);
    // A page overlapping a device range is never cached into the TLB's fast
    // `phys_page` array: every fetch from it must re-enter this function and
    // re-run the device check above, instead of a repeat visit finding a
    // stale fast-path entry (`install_ram_tlb_entry` applies the same guard
    // for the host RAM pointer half of the TLB).
    if !dangerous {
        machine.cpu_mut().tlb.install_phys_page(vaddr_page, page_shift, page_id);

        if !machine.cpu().tlb.has_phys_translation(paddr_page) {
            machine.cpu_mut().tlb.invalidate_paddr(paddr_page, page_shift, true);
            machine.cpu_mut().tlb.mark_phys_translation(paddr_page);
        }
    }

    set_cur_ic(machine, page_id, pc);
}

/// Translates `pc` for an instruction fetch, retrying once at the
/// (possibly updated) PC if the architecture vectored a fault on the first
/// attempt, the original's "translate, and if that fails, the fault
/// handler may have pointed PC at a handler that itself needs translating"
/// double-attempt.
fn translate_pc<A: Architecture>(machine: &mut Machine<A>, pc: u64) -> Option<u64> {
    let flags = TranslateFlags { instr: true, ..Default::default() };
    match A::translate_address(machine, pc, flags) {
        TranslateOutcome::Ok(p) => return Some(p),
        TranslateOutcome::Failed => {}
    }
    let retry_pc = machine.cpu().pc;
    match A::translate_address(machine, retry_pc, flags) {
        TranslateOutcome::Ok(p) => Some(p),
        TranslateOutcome::Failed => {
            machine.cpu_mut().running = false;
            None
        }
    }
}

fn set_cur_ic<A: Architecture>(machine: &mut Machine<A>, page_id: PageId, pc: u64) {
    let page_size = A::page_size();
    let offset = pc & (page_size - 1);
    let ic_index = (offset >> A::PC_TO_IC_SHIFT) as u32;
    let cpu = machine.cpu_mut();
    cpu.cur_page = Some(page_id);
    cpu.next_ic = ic_index;
}

/// `cpu_run_instr`: runs the current CPU until it suspends (exception,
/// halted IC, single-step boundary) or the per-call instruction budget is
/// exhausted. Returns the number of guest instructions whose state
/// transitions were fully applied, for the outer scheduler's tick
/// accounting. The unroll width and budget come from the `Machine`'s
/// [`crate::EngineConfig`] (`batch_size`, `max_instrs_per_run`).
pub fn cpu_run_instr<A: Architecture>(machine: &mut Machine<A>) -> i64 {
    pc_to_pointers(machine);
    if !machine.cpu().running {
        return 0;
    }
    machine.cpu_mut().running_translated = true;

    let batch_size = machine.batch_size;
    let max_instrs_per_run = machine.max_instrs_per_run;

    let mut n: i64;
    if machine.cpu().single_step {
        // Multiple ICs cannot stay combined once we're single-stepping
        // (each step must be individually observable/re-decodable), but
        // only pages that actually carry a fusion pay that cost: flushing
        // a page with no `COMBINATIONS` would needlessly force every
        // instruction on it to redecode on every subsequent step.
        if let Some(page_id) = machine.cpu().cur_page {
            if machine.tc.page(page_id).flags.contains(dyntrans_tc::PageFlags::COMBINATIONS) {
                machine.tc.flush_page_to_untranslated(page_id);
            }
        }
        step_one(machine);
        n = 1;
    } else {
        n = 0;
        loop {
            // Pre-count optimistically, one per dispatch, the same way the
            // original's unrolled block does; but only for the dispatches
            // that actually happened. A halt/abort partway through the
            // batch must not credit the slots that were never reached, or
            // `n` over-reports relative to the "instructions whose state
            // transitions were fully applied" invariant (`spec.md` §8):
            // unlike a batch that runs to completion, there is no later
            // `end_of_page`/`nothing_call` dispatch left to decrement it
            // back down.
            let mut executed = 0i64;
            for _ in 0..batch_size {
                step_one(machine);
                executed += 1;
                if !machine.cpu().running {
                    break;
                }
            }
            n += executed;
            if !machine.cpu().running || !machine.cpu().running_translated || n + machine.cpu().n_translated_instrs >= max_instrs_per_run {
                break;
            }
        }
    }

    n += machine.cpu().n_translated_instrs;
    resync_pc(machine);
    machine.cpu_mut().n_translated_instrs = 0;
    n
}

fn step_one<A: Architecture>(machine: &mut Machine<A>) {
    let page_id = match machine.cpu().cur_page {
        Some(p) => p,
        None => return,
    };
    let slot = machine.cpu().next_ic;
    let ic = machine.tc.page(page_id).ic_entries()[slot as usize];
    machine.cpu_mut().next_ic = slot + 1;
    ic.call(machine);
}

/// Resynchronises `cpu.pc` from how far `next_ic` advanced within the page,
/// per `spec.md` §4.6's three cases (mid-page, sentinel, delay-slot
/// sentinel).
fn resync_pc<A: Architecture>(machine: &mut Machine<A>) {
    if machine.cpu().cur_page.is_none() {
        return;
    }
    let page_size = A::page_size();
    let page_mask = page_size - 1;
    let low = machine.cpu().next_ic as u64;
    let entries = A::IC_ENTRIES_PER_PAGE as u64;
    let pc = machine.cpu().pc;

    let new_pc = if low < entries {
        (pc & !page_mask) | (low << A::PC_TO_IC_SHIFT)
    } else if low == entries {
        (pc & !page_mask).wrapping_add(entries << A::PC_TO_IC_SHIFT)
    } else {
        (pc & !page_mask).wrapping_add((entries + 1) << A::PC_TO_IC_SHIFT)
    };
    machine.cpu_mut().pc = new_pc;
}
