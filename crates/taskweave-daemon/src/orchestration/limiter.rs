//! Two-pool slot limiter for task invocations.
//!
//! The [`ConcurrencyLimiter`] holds a global pool (overall throughput cap) and
//! a child pool reserved for nested spawns, so a burst of sub-agent
//! delegation cannot consume the capacity top-level tasks need. Both pools are
//! sized once at construction.
//!
//! A [`SlotPermit`] returns its slot when dropped.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default global capacity when 0 is configured.
const DEFAULT_GLOBAL_SLOTS: usize = 5;

/// Default child-pool multiplier applied to the global capacity.
const DEFAULT_CHILD_MULTIPLIER: usize = 2;

/// Which slot pool a caller draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPool {
    Global,
    Child,
}

impl SlotPool {
    /// Nested tasks (depth > 0) use the child pool.
    pub const fn for_depth(depth: u32) -> Self {
        if depth > 0 { Self::Child } else { Self::Global }
    }
}

impl fmt::Display for SlotPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Child => f.write_str("child"),
        }
    }
}

/// A held execution slot. Dropping it returns the slot to its pool.
#[derive(Debug)]
pub struct SlotPermit {
    pool: SlotPool,
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    pub const fn pool(&self) -> SlotPool {
        self.pool
    }
}

/// Bounded global and child slot pools.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    global: Arc<Semaphore>,
    child: Arc<Semaphore>,
    global_capacity: usize,
    child_capacity: usize,
}

impl ConcurrencyLimiter {
    /// Create a limiter with explicit capacities. A zero global capacity falls
    /// back to the default; a zero child capacity derives from the global one.
    pub fn new(global_capacity: usize, child_capacity: usize) -> Self {
        let global_capacity = if global_capacity == 0 {
            DEFAULT_GLOBAL_SLOTS
        } else {
            global_capacity
        };
        let child_capacity = if child_capacity == 0 {
            global_capacity * DEFAULT_CHILD_MULTIPLIER
        } else {
            child_capacity
        };

        info!(global_capacity, child_capacity, "ConcurrencyLimiter created");

        Self {
            global: Arc::new(Semaphore::new(global_capacity)),
            child: Arc::new(Semaphore::new(child_capacity)),
            global_capacity,
            child_capacity,
        }
    }

    /// Create a limiter from daemon config values.
    pub fn from_config(config: &taskweave_core::config::DaemonConfig) -> Self {
        Self::new(config.max_concurrent, config.child_pool_size())
    }

    fn semaphore(&self, pool: SlotPool) -> &Arc<Semaphore> {
        match pool {
            SlotPool::Global => &self.global,
            SlotPool::Child => &self.child,
        }
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self, pool: SlotPool) -> Option<SlotPermit> {
        let permit = Arc::clone(self.semaphore(pool)).try_acquire_owned().ok()?;
        Some(SlotPermit {
            pool,
            _permit: permit,
        })
    }

    /// Wait for a slot in `pool`, giving up when `cancel` fires.
    pub async fn acquire(
        &self,
        pool: SlotPool,
        cancel: &CancellationToken,
    ) -> Result<SlotPermit, LimiterError> {
        let semaphore = Arc::clone(self.semaphore(pool));
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(%pool, "Slot wait cancelled");
                Err(LimiterError::Cancelled)
            }
            permit = semaphore.acquire_owned() => {
                let permit = permit.map_err(|_| LimiterError::Closed)?;
                Ok(SlotPermit { pool, _permit: permit })
            }
        }
    }

    /// Close both pools; pending and future acquisitions fail with `Closed`.
    pub fn close(&self) {
        self.global.close();
        self.child.close();
    }

    pub const fn capacity(&self, pool: SlotPool) -> usize {
        match pool {
            SlotPool::Global => self.global_capacity,
            SlotPool::Child => self.child_capacity,
        }
    }

    /// Number of free slots remaining in `pool`.
    pub fn available(&self, pool: SlotPool) -> usize {
        self.semaphore(pool).available_permits()
    }

    /// Number of slots currently held in `pool`.
    pub fn in_use(&self, pool: SlotPool) -> usize {
        self.capacity(pool).saturating_sub(self.available(pool))
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBAL_SLOTS, 0)
    }
}

/// Errors from slot acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    /// The caller's cancellation signal fired while waiting.
    #[error("cancelled while waiting for an execution slot")]
    Cancelled,

    /// The limiter was shut down.
    #[error("concurrency limiter has been closed")]
    Closed,
}
