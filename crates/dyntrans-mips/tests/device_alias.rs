//! A cross-page branch whose target lands on a registered device range,
//! not RAM. The fast dyntrans path must refuse to cache a translation for
//! that page; every visit re-enters the engine's normal translate-and-check
//! path, and the device sees every fetch.

use dyntrans_core::{cpu_run_instr, memory_rw, AccessFlags, Machine};
use dyntrans_mem::{Device, DeviceFlags};
use dyntrans_mips::Mips;

struct Framebuffer {
    reads: u32,
}

impl Device for Framebuffer {
    fn name(&self) -> &str {
        "framebuffer"
    }

    fn access(&mut self, _offset: u64, data: &mut [u8], write: bool) -> bool {
        if !write {
            self.reads += 1;
            data.fill(0);
        }
        true
    }
}

fn word_j(target: u32, vaddr: u32) -> u32 {
    let next_pc = vaddr.wrapping_add(4);
    let region_bits = (target & 0x0FFF_FFFF) >> 2;
    (0x02 << 26) | region_bits | (next_pc & 0xF000_0000)
}

fn word_addiu(rt: u32, rs: u32, imm: u16) -> u32 {
    (0x09 << 26) | (rs << 21) | (rt << 16) | imm as u32
}

fn install(machine: &mut Machine<Mips>, base: u64, words: &[u32]) {
    for (i, w) in words.iter().enumerate() {
        let mut buf = w.to_le_bytes();
        assert!(memory_rw(machine, base + (i as u64) * 4, &mut buf, true, AccessFlags::default()));
    }
}

#[test]
fn branch_into_device_page_refuses_the_fast_path_and_routes_through_the_device() {
    let mut machine: Machine<Mips> = Machine::new(1 << 20, 1);
    machine.bus.devices.register(0xA0000, 0x10000, DeviceFlags::EMULATED_RAM, Box::new(Framebuffer { reads: 0 }));

    // Last two slots of the page [0x9F000, 0xA0000): a jump to the device
    // range, with its delay slot physically landing at the device's first
    // byte (0xA0000).
    install(&mut machine, 0x9FFF8, &[word_j(0xA0000, 0x9FFF8), word_addiu(5, 0, 11)]);

    machine.cpu_mut().pc = 0x9FFF8;
    machine.cpu_mut().single_step = true;
    for _ in 0..3 {
        cpu_run_instr(&mut machine);
        if !machine.cpu().running {
            break;
        }
    }

    // r5 is set by the delay-slot instruction physically stored at 0x9FFFC,
    // executed before control crosses into the device page.
    assert_eq!(machine.cpu().regs.get(5), 11);
    // The device page was read (as zero-filled bytes), decode of the
    // all-zero word failed, and the CPU halted rather than silently
    // executing garbage as code.
    assert!(!machine.cpu().running);

    // No PPTR pointer was cached into the TLB's fast array for the device
    // page: `page_is_dyntrans_dangerous` must have steered `pc_to_pointers`
    // away from `install_phys_page`.
    assert!(machine.cpu().tlb.fast_lookup(0xA0000 >> 12).phys_page.is_none());
}
