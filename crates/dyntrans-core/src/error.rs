//! Typed error taxonomy for the paths that can fail without raising a
//! guest-architectural exception (`spec.md` §7).
//!
//! Most guest-visible failures (decode failure, translation fault, bus
//! error) are modelled as state transitions on [`crate::cpu::Cpu`]
//! (`running = false`, `running_translated = false`) rather than as `Err`
//! values, matching the original's "exceptions are state transitions, not
//! host control flow" design. [`EngineError`] covers the remaining cases
//! that are host-side failures, not guest-architectural ones.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("physical address {paddr:#x} is outside configured RAM and no device claims it")]
    UnmappedAddress { paddr: u64 },

    #[error("host allocation failed while {context}")]
    HostOom { context: &'static str },
}
