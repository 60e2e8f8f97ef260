//! Polling dispatcher that runs assigned "todo" board tasks.
//!
//! [`TaskBoardDispatcher`] scans the board on a fixed interval, and
//! immediately whenever the previous batch drains:
//!
//! 1. Tasks stuck in "doing" longer than the stuck threshold go back to "todo"
//!    with a system comment (crash recovery). This runs on every scan.
//! 2. If any task from the previous batch is still running, the scan stops
//!    here. Only one batch is outstanding at a time.
//! 3. Otherwise assigned "todo" tasks are moved to "doing" and launched, up to
//!    `max_concurrent_tasks` per scan (0 = unlimited).
//!
//! Scans never overlap, and a task is claimed by a conditional "todo" to
//! "doing" move, so no task is launched twice.
//!
//! Each launch runs under a guard that decrements the active count on exit
//! (signalling a re-scan when it reaches zero) and moves the task to "failed"
//! if its execution panics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use taskweave_core::config::BoardConfig;
use taskweave_core::db::seconds_since;
use taskweave_core::duration::{format_duration, parse_duration_or};

use crate::orchestration::guard::{Aborted, catch_panic};
use crate::orchestration::{DispatchError, Dispatcher, LimiterError, Task, TaskResult};

use super::models::{BoardStatus, BoardTask, DEFAULT_PROJECT, RunStats, TaskFilter};
use super::store::BoardStore;

/// Default scan interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default age after which a "doing" task is considered orphaned.
pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(2 * 60 * 60);

/// Comments longer than this many characters are cut.
pub const MAX_COMMENT_CHARS: usize = 2000;

const TRUNCATION_SUFFIX: &str = "\n... (truncated)";
const SYSTEM_AUTHOR: &str = "system";

/// Plain values the dispatcher is constructed with.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub interval: Duration,
    pub stuck_threshold: Duration,
    /// Launch cap per scan; 0 means unlimited.
    pub max_concurrent_tasks: usize,
    pub default_model: Option<String>,
    /// Budget ceiling in USD; 0 disables clamping.
    pub max_budget: f64,
    /// Passed to the board's auto-retry hook after a failure.
    pub max_retries: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            max_concurrent_tasks: 0,
            default_model: None,
            max_budget: 0.0,
            max_retries: 3,
        }
    }
}

impl DispatcherSettings {
    /// Build settings from board config. Unparsable durations fall back to
    /// their defaults with a warning.
    pub fn from_config(config: &BoardConfig) -> Self {
        let auto = &config.auto_dispatch;

        let (interval, err) = parse_duration_or(&auto.interval, DEFAULT_INTERVAL);
        if let Some(e) = err {
            warn!(raw = %auto.interval, error = %e, "Invalid dispatch interval, using 5m");
        }
        let (stuck_threshold, err) =
            parse_duration_or(&auto.stuck_threshold, DEFAULT_STUCK_THRESHOLD);
        if let Some(e) = err {
            warn!(raw = %auto.stuck_threshold, error = %e, "Invalid stuck threshold, using 2h");
        }

        Self {
            interval: if interval.is_zero() { DEFAULT_INTERVAL } else { interval },
            stuck_threshold,
            max_concurrent_tasks: auto.max_concurrent_tasks,
            default_model: auto.default_model.clone().filter(|m| !m.is_empty()),
            max_budget: auto.max_budget,
            max_retries: config.max_retries,
        }
    }

    /// Task model first, then the dispatcher default.
    pub fn resolve_model(&self, task: &BoardTask) -> Option<String> {
        task.model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| self.default_model.clone())
    }

    /// Clamp an unset or overlarge budget to `max_budget` when one is set.
    pub fn resolve_budget(&self, budget: Option<f64>) -> Option<f64> {
        if self.max_budget > 0.0 {
            match budget {
                Some(b) if b > 0.0 && b <= self.max_budget => Some(b),
                _ => Some(self.max_budget),
            }
        } else {
            budget
        }
    }
}

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Stuck tasks reset to "todo".
    pub reset: usize,
    /// Tasks launched this scan.
    pub launched: usize,
    /// Eligible tasks left for a later scan because of the per-scan cap.
    pub deferred: usize,
    /// The scan stopped after recovery because work was still in flight.
    pub skipped_busy: bool,
}

struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polling scheduler over the task board.
pub struct TaskBoardDispatcher {
    store: Arc<dyn BoardStore>,
    dispatcher: Arc<Dispatcher>,
    settings: DispatcherSettings,
    active: AtomicUsize,
    rescan: Notify,
    idle: Notify,
    tracker: TaskTracker,
    scan_lock: AsyncMutex<()>,
    cancel: Mutex<CancellationToken>,
    run_loop: Mutex<Option<LoopHandle>>,
}

impl TaskBoardDispatcher {
    pub fn new(
        store: Arc<dyn BoardStore>,
        dispatcher: Arc<Dispatcher>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            settings,
            active: AtomicUsize::new(0),
            rescan: Notify::new(),
            idle: Notify::new(),
            tracker: TaskTracker::new(),
            scan_lock: AsyncMutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            run_loop: Mutex::new(None),
        }
    }

    pub const fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Number of launched tasks that have not finished yet.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.run_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the scan loop. Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut run_loop = self.run_loop.lock().unwrap_or_else(PoisonError::into_inner);
        if run_loop.is_some() {
            return false;
        }

        let cancel = {
            let mut current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
            current.clone()
        };
        self.tracker.reopen();

        info!(
            interval = %format_duration(self.settings.interval),
            "Task board auto-dispatch started"
        );

        let this = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { this.run(loop_cancel).await });
        *run_loop = Some(LoopHandle { cancel, handle });
        true
    }

    /// Stop the scan loop, cancel in-flight tasks and wait for all of them to exit.
    ///
    /// Safe to call when not running; it still waits for any work launched by
    /// direct [`scan`](Self::scan) calls.
    pub async fn stop(&self) {
        let run_loop = self
            .run_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        self.current_cancel().cancel();
        if let Some(LoopHandle { cancel, handle }) = run_loop {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Task board dispatch stopped; all in-flight tasks finished");
    }

    /// Wait until no launched task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(self.settings.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Task board auto-dispatch loop shutting down");
                    return;
                }
                _ = timer.tick() => {
                    self.scan().await;
                }
                () = self.rescan.notified() => {
                    info!("All dispatched tasks finished, re-scanning immediately");
                    self.scan().await;
                }
            }
        }
    }

    /// Run one scan: stuck recovery, then launch eligible tasks if idle.
    ///
    /// Concurrent calls run one after another.
    pub async fn scan(self: &Arc<Self>) -> ScanReport {
        let _scan = self.scan_lock.lock().await;
        let mut report = ScanReport {
            reset: self.reset_stuck().await,
            ..ScanReport::default()
        };

        let active = self.active_count();
        if active > 0 {
            info!(active, "Scan skipped, waiting for running tasks");
            report.skipped_busy = true;
            return report;
        }

        let tasks = match self.store.list_tasks(&TaskFilter::status(BoardStatus::Todo)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Task board scan failed to list tasks");
                return report;
            }
        };

        let cap = self.settings.max_concurrent_tasks;
        let cancel = self.current_cancel();
        let eligible: Vec<BoardTask> = tasks
            .into_iter()
            .filter(|t| !t.assignee.is_empty())
            .collect();
        let total = eligible.len();

        for (index, task) in eligible.into_iter().enumerate() {
            if cap > 0 && report.launched >= cap {
                report.deferred = total - index;
                info!(
                    limit = cap,
                    deferred = report.deferred,
                    "Per-scan cap reached, deferring remaining tasks"
                );
                break;
            }

            match self
                .store
                .move_task_if(&task.id, BoardStatus::Todo, BoardStatus::Doing)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(task_id = %task.id, "Task left 'todo' before it was claimed");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to move task to doing");
                    continue;
                }
            }

            info!(
                task_id = %task.id,
                title = %task.title,
                assignee = %task.assignee,
                "Picking up board task"
            );
            self.launch(task, cancel.clone());
            report.launched += 1;
        }

        debug!(?report, "Scan finished");
        report
    }

    async fn reset_stuck(&self) -> usize {
        let doing = match self.store.list_tasks(&TaskFilter::status(BoardStatus::Doing)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Stuck-task query failed");
                return 0;
            }
        };

        let threshold = self.settings.stuck_threshold;
        let mut reset = 0;
        for task in doing {
            if Duration::from_secs(seconds_since(task.updated_at)) <= threshold {
                continue;
            }
            match self
                .store
                .move_task_if(&task.id, BoardStatus::Doing, BoardStatus::Todo)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(task_id = %task.id, "Stuck task finished before reset");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to reset stuck task");
                    continue;
                }
            }

            let comment = format!(
                "[auto-reset] Stuck in 'doing' for >{} (likely daemon restart). Reset to 'todo' for re-dispatch.",
                format_duration(threshold)
            );
            if let Err(e) = self.store.add_comment(&task.id, SYSTEM_AUTHOR, &comment).await {
                warn!(task_id = %task.id, error = %e, "Failed to add reset comment");
            }

            info!(
                task_id = %task.id,
                title = %task.title,
                threshold = %format_duration(threshold),
                "Reset stuck doing task"
            );
            reset += 1;
        }
        reset
    }

    fn launch(self: &Arc<Self>, task: BoardTask, cancel: CancellationToken) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);

        self.tracker.spawn(async move {
            let _active = ActiveGuard(Arc::clone(&this));
            let task_id = task.id.clone();
            let worker = Arc::clone(&this);

            match catch_panic(async move { worker.run_task(task, cancel).await }).await {
                Ok(()) => {}
                Err(Aborted::Panicked(msg)) => {
                    error!(task_id = %task_id, panic = %msg, "Panic while running board task");
                    this.force_failed(&task_id, &format!("Task execution panicked: {msg}"))
                        .await;
                }
                Err(Aborted::Cancelled) => {
                    warn!(task_id = %task_id, "Board task execution aborted");
                    this.force_failed(&task_id, "Task execution aborted").await;
                }
            }
        });
    }

    async fn force_failed(&self, task_id: &str, reason: &str) {
        if let Err(e) = self.store.move_task(task_id, BoardStatus::Failed).await {
            warn!(task_id, error = %e, "Failed to move aborted task to failed");
        }
        if let Err(e) = self.store.add_comment(task_id, SYSTEM_AUTHOR, reason).await {
            warn!(task_id, error = %e, "Failed to add abort comment");
        }
    }

    async fn build_task(&self, board_task: &BoardTask) -> Task {
        let workdir = if board_task.project.is_empty() || board_task.project == DEFAULT_PROJECT {
            None
        } else {
            match self.store.project_workdir(&board_task.project).await {
                Ok(dir) => dir,
                Err(e) => {
                    warn!(
                        task_id = %board_task.id,
                        project = %board_task.project,
                        error = %e,
                        "Project lookup failed"
                    );
                    None
                }
            }
        };

        Task::new(board_task.prompt())
            .with_id(board_task.id.clone())
            .with_name(format!("board:{}", board_task.id))
            .with_agent(board_task.assignee.clone())
            .with_model(self.settings.resolve_model(board_task))
            .with_budget(self.settings.resolve_budget(board_task.budget))
            .with_workdir(workdir)
            .with_source("taskboard")
    }

    async fn run_task(&self, board_task: BoardTask, cancel: CancellationToken) {
        let started = Instant::now();
        let task = self.build_task(&board_task).await;

        let result = match self.dispatcher.dispatch(&task, &cancel).await {
            Ok(result) => result,
            Err(DispatchError::Slot(LimiterError::Cancelled)) => TaskResult {
                status: "cancelled".to_string(),
                error: "cancelled while waiting for an execution slot".to_string(),
                exit_code: -1,
                ..TaskResult::default()
            },
            Err(e) => TaskResult::failure(e.to_string(), -1),
        };

        self.record_outcome(&board_task, &result, started.elapsed()).await;
    }

    async fn record_outcome(&self, task: &BoardTask, result: &TaskResult, elapsed: Duration) {
        let duration_ms = if result.duration_ms > 0 {
            result.duration_ms
        } else {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        };
        let stats = RunStats {
            cost_usd: result.cost,
            duration_ms,
            session_id: result.session_id.clone(),
        };
        if let Err(e) = self.store.record_run(&task.id, &stats).await {
            warn!(task_id = %task.id, error = %e, "Failed to record cost/duration");
        }

        let rounded = elapsed.as_secs() + u64::from(elapsed.subsec_millis() >= 500);
        let took = format_duration(Duration::from_secs(rounded));

        if result.is_success() {
            if let Err(e) = self.store.move_task(&task.id, BoardStatus::Done).await {
                warn!(task_id = %task.id, error = %e, "Failed to move task to done");
            }
            let comment = format!(
                "Task completed in {took} (cost: ${:.4})\n\n{}",
                result.cost,
                truncate_comment(&result.output)
            );
            if let Err(e) = self.store.add_comment(&task.id, &task.assignee, &comment).await {
                warn!(task_id = %task.id, error = %e, "Failed to add completion comment");
            }
            info!(task_id = %task.id, cost = result.cost, duration = %took, "Board task completed");
        } else {
            if let Err(e) = self.store.move_task(&task.id, BoardStatus::Failed).await {
                warn!(task_id = %task.id, error = %e, "Failed to move task to failed");
            }
            let comment = format!(
                "Task failed (exit code: {}, duration: {took})\n\n{}",
                result.exit_code,
                truncate_comment(result.failure_text())
            );
            if let Err(e) = self.store.add_comment(&task.id, &task.assignee, &comment).await {
                warn!(task_id = %task.id, error = %e, "Failed to add failure comment");
            }
            warn!(task_id = %task.id, error = %result.error, "Board task failed");

            match self.store.auto_retry_failed(self.settings.max_retries).await {
                Ok(0) => {}
                Ok(n) => info!(retried = n, "Requeued failed tasks"),
                Err(e) => warn!(error = %e, "Auto-retry of failed tasks failed"),
            }
        }
    }

    fn finish_one(&self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            // A stored permit coalesces repeated signals into one pending re-scan.
            self.rescan.notify_one();
            self.idle.notify_waiters();
        }
    }
}

/// Decrements the active count when a launched task exits by any path.
struct ActiveGuard(Arc<TaskBoardDispatcher>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

/// Cut `text` to [`MAX_COMMENT_CHARS`] characters, marking the cut.
pub fn truncate_comment(text: &str) -> String {
    match text.char_indices().nth(MAX_COMMENT_CHARS) {
        Some((byte_idx, _)) => format!("{}{TRUNCATION_SUFFIX}", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use taskweave_core::config::AutoDispatchConfig;

    use super::*;

    fn board_task(model: Option<&str>) -> BoardTask {
        BoardTask {
            id: "t1".into(),
            project: DEFAULT_PROJECT.into(),
            title: "Fix".into(),
            description: String::new(),
            status: BoardStatus::Todo,
            assignee: "coder".into(),
            priority: "medium".into(),
            model: model.map(str::to_string),
            budget: None,
            depends_on: Vec::new(),
            retry_count: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            session_id: None,
            created_at: 0,
            updated_at: 0,
            completed_at: None,
        }
    }

    #[test]
    fn settings_from_config() {
        let config = BoardConfig {
            max_retries: 4,
            auto_dispatch: AutoDispatchConfig {
                interval: "30s".into(),
                stuck_threshold: "90m".into(),
                max_concurrent_tasks: 2,
                default_model: Some("sonnet".into()),
                max_budget: 1.5,
                ..AutoDispatchConfig::default()
            },
        };
        let settings = DispatcherSettings::from_config(&config);
        assert_eq!(settings.interval, Duration::from_secs(30));
        assert_eq!(settings.stuck_threshold, Duration::from_secs(90 * 60));
        assert_eq!(settings.max_concurrent_tasks, 2);
        assert_eq!(settings.default_model.as_deref(), Some("sonnet"));
        assert_eq!(settings.max_retries, 4);
    }

    #[test]
    fn invalid_durations_fall_back() {
        let mut config = BoardConfig::default();
        config.auto_dispatch.interval = "often".into();
        config.auto_dispatch.stuck_threshold = "2 hours".into();
        let settings = DispatcherSettings::from_config(&config);
        assert_eq!(settings.interval, DEFAULT_INTERVAL);
        assert_eq!(settings.stuck_threshold, DEFAULT_STUCK_THRESHOLD);
    }

    #[test]
    fn model_prefers_task_then_default() {
        let settings = DispatcherSettings {
            default_model: Some("haiku".into()),
            ..DispatcherSettings::default()
        };
        assert_eq!(settings.resolve_model(&board_task(Some("opus"))).as_deref(), Some("opus"));
        assert_eq!(settings.resolve_model(&board_task(Some(""))).as_deref(), Some("haiku"));
        assert_eq!(settings.resolve_model(&board_task(None)).as_deref(), Some("haiku"));
        assert_eq!(DispatcherSettings::default().resolve_model(&board_task(None)), None);
    }

    #[test]
    fn budget_clamps_to_max() {
        let settings = DispatcherSettings {
            max_budget: 2.0,
            ..DispatcherSettings::default()
        };
        assert_eq!(settings.resolve_budget(None), Some(2.0));
        assert_eq!(settings.resolve_budget(Some(5.0)), Some(2.0));
        assert_eq!(settings.resolve_budget(Some(0.5)), Some(0.5));

        let unlimited = DispatcherSettings::default();
        assert_eq!(unlimited.resolve_budget(None), None);
        assert_eq!(unlimited.resolve_budget(Some(5.0)), Some(5.0));
    }

    #[test]
    fn truncates_long_comments() {
        assert_eq!(truncate_comment("short"), "short");

        let exact = "x".repeat(MAX_COMMENT_CHARS);
        assert_eq!(truncate_comment(&exact), exact);

        let long = "é".repeat(MAX_COMMENT_CHARS + 10);
        let cut = truncate_comment(&long);
        assert!(cut.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(cut.chars().count(), MAX_COMMENT_CHARS + TRUNCATION_SUFFIX.chars().count());
    }
}
