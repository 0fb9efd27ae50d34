//! Engine-wide tuning knobs, as a plain value struct rather than
//! per-architecture preprocessor constants (translation cache hash-table
//! size, the reset threshold, the guest RAM block size, the victim TLB's
//! size, the dispatch loop's unroll width and per-call instruction budget).

/// Tuning knobs for one [`crate::machine::Machine`]. All fields have
/// defaults that keep existing behaviour unchanged; override individual
/// fields via struct-update syntax
/// (`EngineConfig { tc_max_pages: 65536, ..Default::default() }`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// log2 of the translation cache's hash-table size.
    pub tc_hash_bits: u32,
    /// Upper bound on live physical-page translation records before the
    /// cache is wholesale reset.
    pub tc_max_pages: usize,
    /// log2 of the guest-physical RAM block size.
    pub memblock_bits: u32,
    /// Total victim-table entries, split evenly between the data and code
    /// halves.
    pub victim_tlb_entries: usize,
    /// Instructions dispatched per unrolled inner-loop iteration.
    pub batch_size: u32,
    /// Per-`cpu_run_instr` instruction budget before the outer loop forces
    /// a return.
    pub max_instrs_per_run: i64,
    /// Whether an access past the end of installed RAM/devices raises a
    /// bus-error exception or is silently dropped/zero-filled.
    pub dbe_on_nonexistant_memaccess: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tc_hash_bits: 12,
            tc_max_pages: 4096,
            memblock_bits: dyntrans_mem::block::DEFAULT_BLOCK_BITS,
            victim_tlb_entries: 1024,
            batch_size: 60,
            max_instrs_per_run: 16384,
            dbe_on_nonexistant_memaccess: false,
        }
    }
}
