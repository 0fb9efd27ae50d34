//! Instruction decode: maps a 32-bit big-/little-endian word plus the
//! vaddr it was fetched from to the handler and operand triple that should
//! be installed into the IC slot.
//!
//! Only the subset of the classic MIPS-I encoding this crate's handlers
//! implement is recognised; anything else decodes to `None`, the signal
//! `to_be_translated` treats as a decode failure.

use dyntrans_core::Machine;
use dyntrans_tc::{Handler, Operand};

use crate::exec;
use crate::Mips;

fn rs(word: u32) -> u16 {
    ((word >> 21) & 0x1f) as u16
}

fn rt(word: u32) -> u16 {
    ((word >> 16) & 0x1f) as u16
}

fn rd(word: u32) -> u16 {
    ((word >> 11) & 0x1f) as u16
}

fn funct(word: u32) -> u32 {
    word & 0x3f
}

fn imm16(word: u32) -> u16 {
    (word & 0xffff) as u16
}

fn sext_imm(word: u32) -> u64 {
    (imm16(word) as i16) as i64 as u64
}

/// Decodes `word`, fetched from `vaddr`, into the handler/operands pair to
/// install. Branch targets are resolved to absolute addresses here, once,
/// so the handler never needs `vaddr` itself.
pub fn decode(word: u32, vaddr: u64) -> Option<(Handler<Machine<Mips>>, [Operand; 3])> {
    let opcode = (word >> 26) & 0x3f;
    match opcode {
        // SPECIAL: register-register ALU ops.
        0x00 => match funct(word) {
            0x20 | 0x21 => Some((exec::h_add, [Operand::Reg(rd(word)), Operand::Reg(rs(word)), Operand::Reg(rt(word))])),
            _ => None,
        },
        // ADDIU rt, rs, imm
        0x09 => Some((exec::h_addiu, [Operand::Reg(rt(word)), Operand::Reg(rs(word)), Operand::Imm(sext_imm(word))])),
        // ORI rt, rs, imm
        0x0D => Some((exec::h_ori, [Operand::Reg(rt(word)), Operand::Reg(rs(word)), Operand::Imm(imm16(word) as u64)])),
        // SB rt, imm(rs)
        0x28 => Some((exec::h_sb, [Operand::Reg(rt(word)), Operand::Reg(rs(word)), Operand::Imm(sext_imm(word))])),
        // J target
        0x02 => {
            let next_pc = vaddr.wrapping_add(4);
            let target = (next_pc & 0xF000_0000) | (((word & 0x03FF_FFFF) as u64) << 2);
            Some((exec::h_j, [Operand::Imm(target), Operand::None, Operand::None]))
        }
        // BEQ rs, rt, offset
        0x04 => {
            let target = vaddr.wrapping_add(4).wrapping_add(sext_imm(word) << 2);
            Some((exec::h_beq, [Operand::Reg(rs(word)), Operand::Reg(rt(word)), Operand::Imm(target)]))
        }
        // BNE rs, rt, offset
        0x05 => {
            let target = vaddr.wrapping_add(4).wrapping_add(sext_imm(word) << 2);
            Some((exec::h_bne, [Operand::Reg(rs(word)), Operand::Reg(rt(word)), Operand::Imm(target)]))
        }
        _ => None,
    }
}
