//! The dispatch primitive shared by the board dispatcher and workflow engine.
//!
//! [`Dispatcher::dispatch`] takes a slot from the [`ConcurrencyLimiter`]
//! (waiting is cancellable) and runs the task through the [`TaskExecutor`].
//! [`Dispatcher::spawn_child`] additionally enforces the nesting-depth and
//! per-parent fan-out limits before a nested task is created.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taskweave_core::config::SpawnConfig;

use super::executor::{Task, TaskExecutor, TaskResult};
use super::guard::{Aborted, catch_panic};
use super::limiter::{ConcurrencyLimiter, LimiterError, SlotPool};
use super::spawn::{SpawnGuard, SpawnTracker};

/// Depth and fan-out limits applied to nested spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnLimits {
    pub max_depth: u32,
    pub max_children_per_task: usize,
}

impl Default for SpawnLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children_per_task: 5,
        }
    }
}

impl From<&SpawnConfig> for SpawnLimits {
    fn from(config: &SpawnConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_children_per_task: config.effective_max_children(),
        }
    }
}

/// Rejections raised before any side effect of a spawn takes place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("max nesting depth exceeded: current depth {depth} >= maxDepth {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error(
        "max children per task exceeded: parent {parent_id} already has {active} active children (limit {limit})"
    )]
    FanOutExceeded {
        parent_id: String,
        active: usize,
        limit: usize,
    },
}

/// Errors returned by [`Dispatcher`] before the executor runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Slot(#[from] LimiterError),
}

/// What a parent asks for when delegating to a nested task.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub prompt: String,
    pub agent: String,
    pub model: Option<String>,
    pub budget: Option<f64>,
    pub timeout: Option<Duration>,
}

/// Slot-limited, panic-contained entry point for running tasks.
pub struct Dispatcher {
    executor: Arc<dyn TaskExecutor>,
    limiter: Arc<ConcurrencyLimiter>,
    tracker: Arc<SpawnTracker>,
    limits: SpawnLimits,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        limiter: Arc<ConcurrencyLimiter>,
        tracker: Arc<SpawnTracker>,
        limits: SpawnLimits,
    ) -> Self {
        Self {
            executor,
            limiter,
            tracker,
            limits,
        }
    }

    pub const fn limits(&self) -> SpawnLimits {
        self.limits
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn tracker(&self) -> &SpawnTracker {
        &self.tracker
    }

    /// Check the depth limit for a caller at `depth`, then claim one of
    /// `parent_id`'s child slots.
    ///
    /// The returned guard releases the child slot when dropped.
    pub fn check_admission(
        &self,
        depth: u32,
        parent_id: &str,
    ) -> Result<SpawnGuard, AdmissionError> {
        if depth >= self.limits.max_depth {
            warn!(depth, max_depth = self.limits.max_depth, "Spawn rejected: depth limit");
            return Err(AdmissionError::DepthExceeded {
                depth,
                max_depth: self.limits.max_depth,
            });
        }
        let limit = self.limits.max_children_per_task;
        self.tracker.admit(parent_id, limit).ok_or_else(|| {
            let active = self.tracker.count(parent_id);
            warn!(parent_id, active, limit, "Spawn rejected: fan-out limit");
            AdmissionError::FanOutExceeded {
                parent_id: parent_id.to_string(),
                active,
                limit,
            }
        })
    }

    /// Run `task` once a slot in its pool is free.
    pub async fn dispatch(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, DispatchError> {
        let pool = SlotPool::for_depth(task.depth());
        let _slot = self.limiter.acquire(pool, cancel).await?;

        info!(
            task_id = %task.id(),
            task_name = %task.name(),
            agent = %task.agent(),
            depth = task.depth(),
            %pool,
            "Dispatching task"
        );
        Ok(self.invoke(task, cancel).await)
    }

    /// Admit and run a nested task on behalf of `parent`.
    ///
    /// The child runs at `parent.depth() + 1`. Its fan-out slot is released
    /// when this call returns, whether the child succeeded, failed or panicked.
    pub async fn spawn_child(
        &self,
        parent: &Task,
        request: SpawnRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, DispatchError> {
        let _guard = self.check_admission(parent.depth(), parent.id())?;

        let child = Task::child_of(parent, request.prompt)
            .with_agent(request.agent)
            .with_model(request.model)
            .with_budget(request.budget)
            .with_timeout(request.timeout);

        self.dispatch(&child, cancel).await
    }

    async fn invoke(&self, task: &Task, cancel: &CancellationToken) -> TaskResult {
        let started = Instant::now();
        let executor = Arc::clone(&self.executor);
        let owned_task = task.clone();
        let owned_cancel = cancel.clone();

        let outcome =
            catch_panic(async move { executor.execute(&owned_task, &owned_cancel).await }).await;

        match outcome {
            Ok(result) => result,
            Err(Aborted::Panicked(msg)) => {
                error!(task_id = %task.id(), panic = %msg, "Task executor panicked");
                TaskResult::failure(format!("task execution panicked: {msg}"), -1)
                    .with_duration_ms(elapsed_ms(started))
            }
            Err(Aborted::Cancelled) => TaskResult {
                status: "cancelled".to_string(),
                error: "execution aborted".to_string(),
                exit_code: -1,
                duration_ms: elapsed_ms(started),
                ..TaskResult::default()
            },
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn execute(&self, task: &Task, _cancel: &CancellationToken) -> TaskResult {
            TaskResult::success(format!("{}@{}", task.prompt(), task.depth()))
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl TaskExecutor for PanickingExecutor {
        async fn execute(&self, _task: &Task, _cancel: &CancellationToken) -> TaskResult {
            panic!("executor exploded")
        }
    }

    /// Blocks until released, so tests can hold children in flight.
    struct GateExecutor {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl TaskExecutor for GateExecutor {
        async fn execute(&self, _task: &Task, _cancel: &CancellationToken) -> TaskResult {
            self.gate.acquire().await.unwrap().forget();
            TaskResult::success("released")
        }
    }

    fn dispatcher(executor: Arc<dyn TaskExecutor>, limits: SpawnLimits) -> Dispatcher {
        Dispatcher::new(
            executor,
            Arc::new(ConcurrencyLimiter::new(2, 4)),
            Arc::new(SpawnTracker::new()),
            limits,
        )
    }

    fn parent_at_depth(depth: u32) -> Task {
        let mut task = Task::new("root").with_id("root");
        for i in 0..depth {
            task = Task::child_of(&task, "nested").with_id(format!("lvl-{i}"));
        }
        task
    }

    #[tokio::test]
    async fn dispatch_runs_executor() {
        let d = dispatcher(Arc::new(EchoExecutor), SpawnLimits::default());
        let result = d
            .dispatch(&Task::new("hello"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.output, "hello@0");
        assert_eq!(d.limiter().in_use(SlotPool::Global), 0);
    }

    #[tokio::test]
    async fn depth_at_limit_is_rejected() {
        let d = dispatcher(Arc::new(EchoExecutor), SpawnLimits::default());
        let parent = parent_at_depth(3);
        let err = d
            .spawn_child(&parent, SpawnRequest::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max nesting depth exceeded"));
        assert_eq!(d.tracker().count(parent.id()), 0);
    }

    #[tokio::test]
    async fn depth_below_limit_is_admitted() {
        let d = dispatcher(Arc::new(EchoExecutor), SpawnLimits::default());
        let parent = parent_at_depth(2);
        let request = SpawnRequest {
            prompt: "child".into(),
            ..SpawnRequest::default()
        };
        let result = d
            .spawn_child(&parent, request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.output, "child@3");
        assert_eq!(d.tracker().count(parent.id()), 0);
    }

    #[tokio::test]
    async fn fan_out_limit_rejects_extra_children() {
        let gate = Arc::new(Semaphore::new(0));
        let d = Arc::new(dispatcher(
            Arc::new(GateExecutor {
                gate: Arc::clone(&gate),
            }),
            SpawnLimits {
                max_depth: 3,
                max_children_per_task: 2,
            },
        ));
        let parent = Task::new("root").with_id("fan");

        let mut handles = Vec::new();
        for _ in 0..2 {
            let d = Arc::clone(&d);
            let parent = parent.clone();
            handles.push(tokio::spawn(async move {
                d.spawn_child(&parent, SpawnRequest::default(), &CancellationToken::new())
                    .await
            }));
        }

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while d.tracker().count("fan") < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let err = d
            .spawn_child(&parent, SpawnRequest::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max children per task exceeded"));
        assert_eq!(d.tracker().count("fan"), 2);

        gate.add_permits(2);
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(d.tracker().count("fan"), 0);
        assert_eq!(d.tracker().tracked_parents(), 0);
    }

    #[tokio::test]
    async fn panicking_executor_becomes_failed_result_and_releases() {
        let d = dispatcher(Arc::new(PanickingExecutor), SpawnLimits::default());
        let parent = Task::new("root").with_id("p");
        let result = d
            .spawn_child(&parent, SpawnRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_success());
        assert!(result.error.contains("executor exploded"));
        assert_eq!(d.tracker().count("p"), 0);
        assert_eq!(d.limiter().in_use(SlotPool::Child), 0);
    }

    #[tokio::test]
    async fn cancelled_wait_reports_slot_error() {
        let d = dispatcher(Arc::new(EchoExecutor), SpawnLimits::default());
        let _a = d.limiter().try_acquire(SlotPool::Global).unwrap();
        let _b = d.limiter().try_acquire(SlotPool::Global).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = d.dispatch(&Task::new("x"), &cancel).await.unwrap_err();
        assert_eq!(err, DispatchError::Slot(LimiterError::Cancelled));
    }

    #[test]
    fn limits_from_config() {
        let config = SpawnConfig {
            max_depth: 4,
            max_children_per_task: 0,
        };
        let limits = SpawnLimits::from(&config);
        assert_eq!(limits.max_depth, 4);
        assert_eq!(limits.max_children_per_task, 5);
    }
}
