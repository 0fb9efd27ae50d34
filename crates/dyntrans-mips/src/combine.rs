//! Recognises the MIPS analogue of the classic "store byte, advance
//! pointer, decrement counter, branch back" loop idiom and fuses it into a
//! single handler backed by `dyntrans_core::combine::bounded_memset`. This
//! is this crate's `ic->combination_check` (`Architecture::to_be_translated`
//! calls it from its decode tail, matching the original's placement).
//!
//! The pattern recognised, ending at the instruction just decoded (a BNE):
//!
//! ```text
//! L:  sb   rx, 0(ry)
//!     addiu ry, ry, 1
//!     addiu rz, rz, -1
//!     bne  rz, r0, L
//! ```

use dyntrans_core::Machine;
use dyntrans_tc::{InstrCall, Operand, PageFlags};

use crate::exec;
use crate::Mips;

const NEG_ONE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

fn as_reg(op: Operand) -> Option<u16> {
    match op {
        Operand::Reg(r) => Some(r),
        _ => None,
    }
}

fn as_imm(op: Operand) -> Option<u64> {
    match op {
        Operand::Imm(v) => Some(v),
        _ => None,
    }
}

/// Examines the four IC slots ending at `bne_slot` (the one `to_be_translated`
/// just installed); if they form the loop above, replaces the branch slot
/// with a fused handler and marks the page `PageFlags::COMBINATIONS`.
/// Returns `true` if a fusion was installed.
pub fn try_combine(machine: &mut Machine<Mips>, page_id: dyntrans_tc::PageId, bne_slot: u32) -> bool {
    if bne_slot < 3 {
        return false;
    }
    let sb_slot = bne_slot - 3;
    let ry_slot = bne_slot - 2;
    let rz_slot = bne_slot - 1;

    let page = machine.tc.page(page_id);
    let entries = page.ic_entries();
    let sb = entries[sb_slot as usize];
    let ry_addiu = entries[ry_slot as usize];
    let rz_addiu = entries[rz_slot as usize];
    let bne = entries[bne_slot as usize];

    if sb.handler as usize != exec::h_sb as usize
        || ry_addiu.handler as usize != exec::h_addiu as usize
        || rz_addiu.handler as usize != exec::h_addiu as usize
        || bne.handler as usize != exec::h_bne as usize
    {
        return false;
    }

    let (Some(rx), Some(sb_base), Some(0)) = (as_reg(sb.args[0]), as_reg(sb.args[1]), as_imm(sb.args[2])) else { return false };
    let (Some(ry_rt), Some(ry_rs), Some(1)) = (as_reg(ry_addiu.args[0]), as_reg(ry_addiu.args[1]), as_imm(ry_addiu.args[2])) else { return false };
    let (Some(rz_rt), Some(rz_rs), Some(NEG_ONE)) = (as_reg(rz_addiu.args[0]), as_reg(rz_addiu.args[1]), as_imm(rz_addiu.args[2])) else { return false };
    let (Some(bne_rs), Some(bne_rt), Some(target)) = (as_reg(bne.args[0]), as_reg(bne.args[1]), as_imm(bne.args[2])) else { return false };

    if sb_base != ry_rs || ry_rt != ry_rs || rz_rt != rz_rs {
        return false;
    }
    let loop_start = page.physaddr + ((sb_slot as u64) << <Mips as dyntrans_core::Architecture>::PC_TO_IC_SHIFT);
    let is_rz_vs_zero = (bne_rs == rz_rs && bne_rt == 0) || (bne_rt == rz_rs && bne_rs == 0);
    if !is_rz_vs_zero || target != loop_start {
        return false;
    }

    machine.tc.page_mut(page_id).ic_entries_mut()[bne_slot as usize] =
        InstrCall::new(h_fused_store_dec_loop, [Operand::Reg(rx), Operand::Reg(ry_rs), Operand::Reg(rz_rs)]);
    machine.tc.page_mut(page_id).flags |= PageFlags::COMBINATIONS;
    true
}

/// The fused handler: one call replaces up to `cap` iterations of the
/// store-increment-decrement-branch loop. Bounded per call (matching
/// `bounded_memset`'s own cap) so the fusion stays interruptible; a loop
/// whose initial counter exceeds the cap simply falls through with a
/// nonzero remainder left in `rz`/`ry`, which is a known limitation of this
/// exemplar fusion rather than a general one; nothing re-arms the branch
/// to pick the remainder back up.
fn h_fused_store_dec_loop(machine: &mut Machine<Mips>, args: [Operand; 3]) {
    let pending = machine.cpu().delay_slot;
    let rx = match args[0] {
        Operand::Reg(r) => r,
        _ => unreachable!(),
    };
    let ry = match args[1] {
        Operand::Reg(r) => r,
        _ => unreachable!(),
    };
    let rz = match args[2] {
        Operand::Reg(r) => r,
        _ => unreachable!(),
    };

    let count = machine.cpu().regs.get(rz as u8);
    if count != 0 {
        let byte = machine.cpu().regs.get(rx as u8) as u8;
        let dest = machine.cpu().regs.get(ry as u8) as u64;
        let written = dyntrans_core::combine::bounded_memset(machine, dest, byte, count as u64, 64);
        machine.cpu_mut().regs.set(ry as u8, (dest + written) as u32);
        machine.cpu_mut().regs.set(rz as u8, count - written as u32);
        // 4 real instructions (sb/addiu/addiu/bne) per byte, minus the one
        // dispatch this fused call itself already counts as.
        machine.cpu_mut().n_translated_instrs += 4 * written as i64 - 1;
    }
    finish(machine, pending);
}

fn finish(machine: &mut Machine<Mips>, pending: dyntrans_core::DelaySlot) {
    if let dyntrans_core::DelaySlot::Armed { delayed_to } = pending {
        machine.cpu_mut().delay_slot = dyntrans_core::DelaySlot::None;
        machine.cpu_mut().pc = delayed_to;
        machine.cpu_mut().invalidate_pointers();
        dyntrans_core::pc_to_pointers(machine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dyntrans_core::{memory_rw, pc_to_pointers, AccessFlags};

    fn word_sb(rt: u32, rs: u32, imm: u16) -> u32 {
        (0x28 << 26) | (rs << 21) | (rt << 16) | imm as u32
    }
    fn word_addiu(rt: u32, rs: u32, imm: u16) -> u32 {
        (0x09 << 26) | (rs << 21) | (rt << 16) | imm as u32
    }
    fn word_bne(rs: u32, rt: u32, offset: i16) -> u32 {
        (0x05 << 26) | (rs << 21) | (rt << 16) | (offset as u16) as u32
    }

    fn install_loop_program(machine: &mut Machine<Mips>, base: u64, iters: u32) {
        // r1 = byte, r2 = dest ptr (= base + 0x100, arbitrary), r3 = counter
        let words = [
            word_sb(1, 2, 0),
            word_addiu(2, 2, 1),
            word_addiu(3, 3, 0xFFFF), // -1
            word_bne(3, 0, -4i16),    // branch back to the sb
            word_addiu(0, 0, 0),      // delay slot: nop
        ];
        for (i, w) in words.iter().enumerate() {
            let mut buf = w.to_le_bytes();
            memory_rw(machine, base + (i as u64) * 4, &mut buf, true, AccessFlags::default());
        }
        machine.cpu_mut().regs.set(1, 0xAB);
        machine.cpu_mut().regs.set(2, 0x8000);
        machine.cpu_mut().regs.set(3, iters);
    }

    #[test]
    fn loop_fuses_after_fourth_instruction_decodes() {
        let mut machine = Machine::new(1 << 20, 1);
        install_loop_program(&mut machine, 0x1000, 10);
        machine.cpu_mut().pc = 0x1000;
        machine.cpu_mut().single_step = true;
        for _ in 0..4 {
            dyntrans_core::cpu_run_instr(&mut machine);
        }
        // Once the bne has been decoded the fourth time, the page carries
        // the fused handler and COMBINATIONS is set.
        pc_to_pointers(&mut machine);
        let page_id = machine.cpu().cur_page.unwrap();
        assert!(machine.tc.page(page_id).flags.contains(PageFlags::COMBINATIONS));
    }

    #[test]
    fn fused_handler_applies_every_iteration_in_one_call() {
        let mut machine = Machine::new(1 << 20, 1);
        install_loop_program(&mut machine, 0x1000, 200);
        machine.cpu_mut().pc = 0x1000;
        // Batch dispatch, not single-step: fusion fires on the first pass's
        // bne decode, but single-stepping would flush it straight back to
        // `to_be_translated` before a second pass ever got to call it (see
        // `cpu_run_instr`'s single-step branch). Only a normal batch run
        // revisits the now-fused slot and folds the remaining iterations.
        dyntrans_core::cpu_run_instr(&mut machine);
        assert_eq!(machine.cpu().regs.get(3), 0);
        assert_eq!(machine.cpu().regs.get(2), 0x8000 + 200);
        let mut byte = [0u8];
        memory_rw(&mut machine, 0x8000, &mut byte, false, AccessFlags::default());
        assert_eq!(byte[0], 0xAB);
        memory_rw(&mut machine, 0x8000 + 199, &mut byte, false, AccessFlags::default());
        assert_eq!(byte[0], 0xAB);
    }
}
