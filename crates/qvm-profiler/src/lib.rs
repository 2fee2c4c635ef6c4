//! # QVM Profiler
//!
//! Per-procedure call counters for bytecode modules and the report built
//! from them.
//!
//! Counters are relaxed atomics. The VM is single-threaded, but a
//! diagnostic thread may read them concurrently and observe stale values.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod counters;
pub mod report;

pub use counters::{CallProfile, CallProfileSnapshot};
pub use report::{ProfileEntry, ProfileReport};
