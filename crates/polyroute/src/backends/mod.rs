//! Executor implementations.
//!
//! Concrete storage engine adapters live in the embedding application and
//! implement [`BackendExecutor`](crate::core::BackendExecutor). This module
//! ships only the in-process [`MemoryExecutor`].

pub mod memory;

pub use memory::{FaultKind, MemoryExecutor};
