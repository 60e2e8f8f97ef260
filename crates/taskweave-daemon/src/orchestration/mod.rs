//! Task orchestration primitives: admission, slot limiting and invocation.
//!
//! - [`SpawnTracker`]: per-parent active child counts for nested spawns.
//! - [`ConcurrencyLimiter`]: global and child slot pools.
//! - [`Dispatcher`]: the single entry point that admits, limits and runs a
//!   [`Task`] through a [`TaskExecutor`].
//! - [`ProcessExecutor`]: runs tasks as agent CLI subprocesses.
//! - [`guard::catch_panic`]: panic containment for every launched unit of work.

pub mod dispatch;
pub mod executor;
pub mod guard;
pub mod limiter;
pub mod process;
pub mod spawn;

pub use dispatch::{AdmissionError, DispatchError, Dispatcher, SpawnLimits, SpawnRequest};
pub use executor::{Task, TaskExecutor, TaskResult};
pub use limiter::{ConcurrencyLimiter, LimiterError, SlotPermit, SlotPool};
pub use process::ProcessExecutor;
pub use spawn::{SpawnGuard, SpawnTracker};
