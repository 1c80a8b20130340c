//! Error kinds surfaced by the migration core.
//!
//! Per the error handling design, most failure modes in this crate (allocator
//! exhaustion, duplicate/unknown acks, samples for unknown pages) are recovered
//! locally and only logged — they never reach a `Result`. Only the two
//! programming-invariant violations below are modeled as errors, and both are
//! treated as fatal by their callers.

use crate::addr::VAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("page table entry for {vaddr} was already MOVING when the executor tried to invalidate it")]
    PteAlreadyMoving { vaddr: VAddr },

    #[error("migration invariant violated: {0}")]
    InvariantViolation(String),
}
