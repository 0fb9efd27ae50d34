//! Guest physical memory substrate and device bus (`spec.md` §4.1, §4.2).
//!
//! This crate is the lowest layer of the dyntrans engine: it knows about
//! guest *physical* addresses only. Virtual addresses, the software TLB and
//! the translation cache live in `dyntrans-core`/`dyntrans-tc`, which
//! compose on top of [`Bus`].

pub mod block;
pub mod device;

pub use block::{HostPtr, SparseMemory};
pub use device::{Device, DeviceBus, DeviceEntry, DeviceFlags};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("bus error accessing device at paddr {paddr:#x}")]
    BusError { paddr: u64 },
}

/// The physical-address-space view combining RAM and the device bus, used
/// by `dyntrans-core::memory_rw` (`spec.md` §4.3 steps 3–5).
pub struct Bus {
    pub ram: SparseMemory,
    pub devices: DeviceBus,
}

impl Bus {
    pub fn new(physical_max: u64) -> Self {
        Self { ram: SparseMemory::new(physical_max), devices: DeviceBus::new() }
    }

    pub fn with_block_bits(physical_max: u64, block_bits: u32) -> Self {
        Self { ram: SparseMemory::with_block_bits(physical_max, block_bits), devices: DeviceBus::new() }
    }
}
