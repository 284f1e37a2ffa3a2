//! Domain model for relayed heart-rate samples.
//!
//! # Responsibility
//! - Define the immutable `Sample` produced by a source adapter.
//! - Define the `CanonicalRecord` wire/storage shape derived from it.
//! - Define the installation identity used to key sink writes.
//!
//! # Invariants
//! - A `Sample` is validated once at construction and never mutated.
//! - Record identity for dedup purposes is the end instant, not a sample id.

pub mod identity;
pub mod record;
pub mod sample;
