//! The memory access path (`spec.md` §4.3): the single entry point every
//! instruction handler and `to_be_translated` goes through to read or write
//! guest memory.

use dyntrans_mem::DeviceFlags;
use tracing::warn;

use crate::arch::{Architecture, TranslateFlags, TranslateOutcome};
use crate::invalidate::InvalidateTarget;
use crate::machine::Machine;
use crate::tlb::UpdateFlags;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheKind {
    #[default]
    None,
    Instruction,
    Data,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AccessFlags {
    pub physical: bool,
    pub cache: CacheKind,
    pub no_exceptions: bool,
    pub user: bool,
}

/// `memory_rw`. `addr` is a guest virtual address unless `flags.physical`.
/// Returns `true` on success; on failure the architecture has already
/// vectored the CPU's fault state unless `flags.no_exceptions`.
pub fn memory_rw<A: Architecture>(machine: &mut Machine<A>, addr: u64, data: &mut [u8], write: bool, flags: AccessFlags) -> bool {
    if data.is_empty() {
        return true;
    }
    let page_size = A::page_size();
    let page_mask = page_size - 1;
    let start_page = addr & !page_mask;
    let end_page = (addr.wrapping_add(data.len() as u64 - 1)) & !page_mask;
    if data.len() > 1 && start_page != end_page {
        return memory_rw_crosspage(machine, addr, data, write, flags);
    }
    memory_rw_single_page(machine, addr, data, write, flags)
}

/// Step 1: per-byte split with write atomicity. A write first dry-runs
/// translation for every byte in the span (without committing or raising
/// exceptions) so that a fault partway through the span is detected before
/// any byte is modified; a real fault on that same byte is then raised for
/// real during the commit pass.
fn memory_rw_crosspage<A: Architecture>(machine: &mut Machine<A>, addr: u64, data: &mut [u8], write: bool, flags: AccessFlags) -> bool {
    if write && !flags.physical {
        for i in 0..data.len() as u64 {
            let probe = TranslateFlags { write: true, instr: flags.cache == CacheKind::Instruction, no_exceptions: true, user: flags.user };
            if let TranslateOutcome::Failed = A::translate_address(machine, addr.wrapping_add(i), probe) {
                return false;
            }
        }
    }
    for (i, byte) in data.iter_mut().enumerate() {
        let mut one = [*byte];
        if !memory_rw_single_page(machine, addr.wrapping_add(i as u64), &mut one, write, flags) {
            return false;
        }
        *byte = one[0];
    }
    true
}

fn memory_rw_single_page<A: Architecture>(machine: &mut Machine<A>, addr: u64, data: &mut [u8], write: bool, flags: AccessFlags) -> bool {
    let paddr = if flags.physical {
        addr
    } else {
        let tflags = TranslateFlags { write, instr: flags.cache == CacheKind::Instruction, no_exceptions: flags.no_exceptions, user: flags.user };
        match A::translate_address(machine, addr, tflags) {
            TranslateOutcome::Ok(p) => p,
            TranslateOutcome::Failed => return false,
        }
    };

    // Step 3: device dispatch.
    if let Some(index) = machine.bus.devices.find_index(paddr) {
        let dev_flags = machine.bus.devices.get(index).flags;
        let ok = machine.bus.devices.access(paddr, data, write).unwrap_or(false);
        if !ok {
            warn!(paddr, write, "bus error accessing device");
            return false;
        }
        if !flags.physical && dev_flags.contains(DeviceFlags::DYNTRANS_OK) && dev_flags.contains(DeviceFlags::EMULATED_RAM) {
            maybe_install_device_backing::<A>(machine, addr, paddr, write, dev_flags);
        }
        return true;
    }

    // Step 4: RAM or past the end of installed memory.
    if paddr >= machine.bus.ram.physical_max() {
        if write {
            if machine.dbe_on_nonexistant_memaccess && !flags.no_exceptions {
                warn!(error = %crate::error::EngineError::UnmappedAddress { paddr }, "raising bus error");
                machine.cpu_mut().running = false;
            }
            return true;
        }
        data.fill(0);
        return true;
    }

    // Step 5: RAM fast path.
    let host = match machine.bus.ram.paddr_to_hostaddr(paddr, write) {
        Some(h) => h,
        None => {
            data.fill(0);
            return true;
        }
    };
    if write {
        unsafe { host.as_mut_slice(data.len()) }.copy_from_slice(data);
    } else {
        data.copy_from_slice(unsafe { host.as_slice(data.len()) });
    }

    if !flags.physical {
        install_ram_tlb_entry::<A>(machine, addr, paddr, write);
    }

    // Step 6: write-invalidates code translation.
    if write {
        let page_size = A::page_size();
        let paddr_page = paddr & !(page_size - 1);
        crate::invalidate::invalidate_code_translation(machine, InvalidateTarget::Paddr(paddr_page), false);
    }
    true
}

fn install_ram_tlb_entry<A: Architecture>(machine: &mut Machine<A>, vaddr: u64, paddr: u64, write: bool) {
    let page_size = A::page_size();
    let page_shift = A::PAGE_SHIFT;
    let vaddr_page = vaddr & !(page_size - 1);
    let paddr_page = paddr & !(page_size - 1);
    if machine.bus.devices.page_is_dyntrans_dangerous(paddr_page, page_size) {
        return;
    }
    let host_page = match machine.bus.ram.paddr_page_to_hostaddr(paddr, page_size, write) {
        Some(h) => h,
        None => return,
    };
    let mut upd = UpdateFlags::empty();
    if write {
        upd |= UpdateFlags::WRITE;
    }
    machine.cpu_mut().tlb.update_translation_table(vaddr_page, host_page, paddr_page, upd, page_shift);
}

fn maybe_install_device_backing<A: Architecture>(machine: &mut Machine<A>, vaddr: u64, paddr: u64, write: bool, dev_flags: DeviceFlags) {
    let page_size = A::page_size();
    let page_shift = A::PAGE_SHIFT;
    let vaddr_page = vaddr & !(page_size - 1);
    let paddr_page = paddr & !(page_size - 1);
    let host = match machine.bus.devices.host_backing(paddr_page) {
        Some((_, h)) => h,
        None => return,
    };
    let mut upd = UpdateFlags::empty();
    if write && dev_flags.contains(DeviceFlags::DYNTRANS_WRITE_OK) {
        upd |= UpdateFlags::WRITE;
    }
    machine.cpu_mut().tlb.update_translation_table(vaddr_page, host, paddr_page, upd, page_shift);
}
