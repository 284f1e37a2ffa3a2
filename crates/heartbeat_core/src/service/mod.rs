//! Use-case services exposed to embedding hosts.
//!
//! # Responsibility
//! - Own the observation session lifecycle (authorize, subscribe, stop).
//! - Publish status and observed records to the presentation layer.
//!
//! # Invariants
//! - At most one active subscription per session object.
//! - Services never bypass pipeline ordering/cursor contracts.

pub mod session_service;
