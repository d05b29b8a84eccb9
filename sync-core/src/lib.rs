//! # sync-core
//!
//! Pure logic for storesync (no I/O, instant tests).
//!
//! This crate implements the state machines and data structures behind
//! persistence scheduling without any runtime, store or medium access,
//! enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (store access, medium reads and writes, task spawning) is
//! performed by `sync-client`, which drives these types.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mode;
pub mod queue;
pub mod state;

pub use mode::{ModeError, PersistMode, StoreMode};
pub use queue::{QueueKey, ScheduleQueue};
pub use state::{Direction, LoadSaveState, PersisterStats};
