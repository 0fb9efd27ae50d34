//! Instruction-call records and the translation-cache arena
//! (`spec.md` §3, §4.4).

pub mod cache;
pub mod ic;
pub mod page;

pub use cache::{TcConfig, TranslationCache};
pub use ic::{Handler, InstrCall, Operand};
pub use page::{PageFlags, PageId, PhysPage};
