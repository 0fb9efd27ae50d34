//! Instruction-call handlers, `to_be_translated` and the two page-sentinel
//! handlers. Every handler follows one trailer convention: capture whatever
//! delay slot state it walked in with, perform its own semantics, then hand
//! that captured state to [`finish`], which is where a *previous*
//! instruction's armed branch actually takes effect, one instruction late
//! (MIPS's one-slot delay, `Architecture::HAS_DELAY_SLOT`).

use dyntrans_core::{memory_rw, pc_to_pointers, AccessFlags, Architecture, ByteOrder, CacheKind, DelaySlot, Machine};
use dyntrans_tc::{InstrCall, Operand, PageFlags};
use tracing::debug;

use crate::{combine, decode, Mips};

fn reg(op: Operand) -> u16 {
    match op {
        Operand::Reg(r) => r,
        other => panic!("expected Operand::Reg, got {other:?}"),
    }
}

fn imm(op: Operand) -> u64 {
    match op {
        Operand::Imm(v) => v,
        other => panic!("expected Operand::Imm, got {other:?}"),
    }
}

/// Applies a delay slot armed by the instruction *before* the one that just
/// ran. Armed by `h_j`/`h_beq`/`h_bne` themselves this call is a no-op: the
/// state they capture at entry is whatever the previous instruction left,
/// never their own.
fn finish(machine: &mut Machine<Mips>, pending: DelaySlot) {
    if let DelaySlot::Armed { delayed_to } = pending {
        machine.cpu_mut().delay_slot = DelaySlot::None;
        machine.cpu_mut().pc = delayed_to;
        machine.cpu_mut().invalidate_pointers();
        pc_to_pointers(machine);
    }
}

pub fn h_addiu(machine: &mut Machine<Mips>, args: [Operand; 3]) {
    let pending = machine.cpu().delay_slot;
    let rt = reg(args[0]);
    let rs = reg(args[1]);
    let v = machine.cpu().regs.get(rs as u8).wrapping_add(imm(args[2]) as u32);
    machine.cpu_mut().regs.set(rt as u8, v);
    finish(machine, pending);
}

pub fn h_ori(machine: &mut Machine<Mips>, args: [Operand; 3]) {
    let pending = machine.cpu().delay_slot;
    let rt = reg(args[0]);
    let rs = reg(args[1]);
    let v = machine.cpu().regs.get(rs as u8) | (imm(args[2]) as u32);
    machine.cpu_mut().regs.set(rt as u8, v);
    finish(machine, pending);
}

pub fn h_add(machine: &mut Machine<Mips>, args: [Operand; 3]) {
    let pending = machine.cpu().delay_slot;
    let rd = reg(args[0]);
    let rs = reg(args[1]);
    let rt = reg(args[2]);
    let v = machine.cpu().regs.get(rs as u8).wrapping_add(machine.cpu().regs.get(rt as u8));
    machine.cpu_mut().regs.set(rd as u8, v);
    finish(machine, pending);
}

pub fn h_sb(machine: &mut Machine<Mips>, args: [Operand; 3]) {
    let pending = machine.cpu().delay_slot;
    let rt = reg(args[0]);
    let rs = reg(args[1]);
    let value = machine.cpu().regs.get(rt as u8) as u8;
    let addr = machine.cpu().regs.get(rs as u8).wrapping_add(imm(args[2]) as u32) as u64;
    let mut byte = [value];
    if !memory_rw(machine, addr, &mut byte, true, AccessFlags::default()) {
        machine.cpu_mut().running = false;
    }
    finish(machine, pending);
}

pub fn h_j(machine: &mut Machine<Mips>, args: [Operand; 3]) {
    let pending = machine.cpu().delay_slot;
    let target = imm(args[0]);
    machine.cpu_mut().delay_slot = DelaySlot::Armed { delayed_to: target };
    finish(machine, pending);
}

pub fn h_beq(machine: &mut Machine<Mips>, args: [Operand; 3]) {
    let pending = machine.cpu().delay_slot;
    let rs = reg(args[0]);
    let rt = reg(args[1]);
    if machine.cpu().regs.get(rs as u8) == machine.cpu().regs.get(rt as u8) {
        machine.cpu_mut().delay_slot = DelaySlot::Armed { delayed_to: imm(args[2]) };
    }
    finish(machine, pending);
}

pub fn h_bne(machine: &mut Machine<Mips>, args: [Operand; 3]) {
    let pending = machine.cpu().delay_slot;
    let rs = reg(args[0]);
    let rt = reg(args[1]);
    if machine.cpu().regs.get(rs as u8) != machine.cpu().regs.get(rt as u8) {
        machine.cpu_mut().delay_slot = DelaySlot::Armed { delayed_to: imm(args[2]) };
    }
    finish(machine, pending);
}

fn fetch_word(machine: &mut Machine<Mips>, vaddr: u64) -> Option<u32> {
    let mut word = [0u8; 4];
    let flags = AccessFlags { cache: CacheKind::Instruction, ..Default::default() };
    if !memory_rw(machine, vaddr, &mut word, false, flags) {
        return None;
    }
    Some(match machine.cpu().byte_order {
        ByteOrder::Big => u32::from_be_bytes(word),
        ByteOrder::Little => u32::from_le_bytes(word),
    })
}

/// `to_be_translated`: decodes the word at the slot currently being
/// dispatched, installs the resulting IC, runs the combiner hook over the
/// just-extended tail of the page, then executes the freshly installed
/// handler this once (the original's tail-call into the handler it just
/// wrote).
pub fn to_be_translated(machine: &mut Machine<Mips>, _args: [Operand; 3]) {
    let page_id = machine.cpu().cur_page.expect("to_be_translated always runs with a current page");
    let slot = machine.cpu().next_ic - 1;
    let physaddr = machine.tc.page(page_id).physaddr;
    let vaddr = physaddr + ((slot as u64) << Mips::PC_TO_IC_SHIFT);

    if machine.cpu().breakpoints.hits(vaddr) {
        debug!(vaddr, "breakpoint hit during translation");
        machine.tc.page_mut(page_id).ic_entries_mut()[slot as usize] = InstrCall::new(Mips::nothing_call, [Operand::None; 3]);
        machine.cpu_mut().running = false;
        return;
    }

    let Some(word) = fetch_word(machine, vaddr) else {
        machine.tc.page_mut(page_id).ic_entries_mut()[slot as usize] = InstrCall::new(Mips::nothing_call, [Operand::None; 3]);
        machine.cpu_mut().running = false;
        return;
    };

    match decode::decode(word, vaddr) {
        Some((handler, args)) => {
            machine.tc.page_mut(page_id).ic_entries_mut()[slot as usize] = InstrCall::new(handler, args);
            machine.tc.page_mut(page_id).flags |= PageFlags::TRANSLATIONS;
            combine::try_combine(machine, page_id, slot);
            handler(machine, args);
        }
        None => {
            debug!(vaddr, word, "decode failed, halting CPU");
            machine.tc.page_mut(page_id).ic_entries_mut()[slot as usize] = InstrCall::new(Mips::nothing_call, [Operand::None; 3]);
            machine.cpu_mut().running = false;
        }
    }
}

/// `end_of_page`: bookkeeping-only sentinel, decrements
/// `n_translated_instrs` since this dispatch represents zero guest
/// instructions. Redirects into `end_of_page2` instead of rolling the page
/// over when a delay slot is still armed (the branch that armed it was the
/// last real instruction on this page; its delay slot lives on the next
/// one).
pub fn end_of_page(machine: &mut Machine<Mips>, _args: [Operand; 3]) {
    machine.cpu_mut().n_translated_instrs -= 1;
    if let DelaySlot::Armed { .. } = machine.cpu().delay_slot {
        machine.cpu_mut().next_ic = Mips::IC_ENTRIES_PER_PAGE as u32 + 1;
        return;
    }
    let page_size = Mips::page_size();
    machine.cpu_mut().pc = (machine.cpu().pc & !(page_size - 1)).wrapping_add(page_size);
    machine.cpu_mut().invalidate_pointers();
    pc_to_pointers(machine);
}

/// `end_of_page2`: executes the one delay-slot instruction that physically
/// lives at the start of the next page, by decoding it and invoking its
/// handler directly (not installing it into any page: the normal dispatch
/// loop will decode it again, for real, once control reaches it via
/// ordinary execution). The handler's own `finish` trailer applies the
/// queued branch immediately afterwards, since `delay_slot` is still armed
/// when it runs.
pub fn end_of_page2(machine: &mut Machine<Mips>, _args: [Operand; 3]) {
    let page_size = Mips::page_size();
    let vaddr = (machine.cpu().pc & !(page_size - 1)).wrapping_add(page_size);
    machine.cpu_mut().in_crosspage_delayslot = true;

    let decoded = fetch_word(machine, vaddr).and_then(|word| decode::decode(word, vaddr));
    match decoded {
        Some((handler, args)) => handler(machine, args),
        None => machine.cpu_mut().running = false,
    }
    machine.cpu_mut().in_crosspage_delayslot = false;
}
