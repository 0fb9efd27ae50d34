//! The architecture-agnostic dyntrans engine: per-CPU TLB, the memory
//! access path, PC resolution, the dispatch loop, invalidation, instruction
//! combining and the outer scheduler. Instantiated per guest ISA by
//! implementing [`arch::Architecture`].

pub mod arch;
pub mod combine;
pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod error;
pub mod invalidate;
pub mod machine;
pub mod memory_rw;
pub mod pagetable;
pub mod scheduler;
pub mod tlb;

pub use arch::{Architecture, ByteOrder, TranslateFlags, TranslateOutcome};
pub use config::EngineConfig;
pub use cpu::{Breakpoints, Cpu, DelaySlot};
pub use dispatch::{cpu_run_instr, pc_to_pointers};
pub use error::EngineError;
pub use invalidate::{invalidate_code_translation, InvalidateTarget};
pub use machine::{Machine, TickSource};
pub use memory_rw::{memory_rw, AccessFlags, CacheKind};
pub use scheduler::{RunMode, Scheduler};
pub use tlb::{Tlb, UpdateFlags};
