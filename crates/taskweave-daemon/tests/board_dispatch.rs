#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Task board dispatcher end to end against in-process stores.
//!
//! Covers the per-scan cap, stuck-task recovery, outcome comments,
//! auto-retry, panic containment and the start/stop lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use taskweave_core::db::unix_timestamp;
use taskweave_daemon::board::{
    BoardError, BoardStatus, BoardStore, BoardTask, Comment, DispatcherSettings,
    InMemoryBoardStore, NewTask, RunStats, TaskBoardDispatcher, TaskFilter,
};
use taskweave_daemon::orchestration::{
    ConcurrencyLimiter, Dispatcher, SpawnLimits, SpawnTracker, Task, TaskExecutor, TaskResult,
};
use taskweave_daemon::storage::Database;

/// Behaviour keyed on the prompt: "panic" panics, "fail" fails, anything
/// else succeeds with a fixed cost.
#[derive(Default)]
struct ScriptedExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task, _cancel: &CancellationToken) -> TaskResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if task.prompt().contains("panic") {
            panic!("executor exploded");
        }
        if task.prompt().contains("fail") {
            return TaskResult::failure("compile error", 2);
        }
        TaskResult::success(format!("did {}", task.prompt())).with_cost(0.25)
    }
}

/// Holds every invocation until a permit is released or the run is cancelled.
struct GatedExecutor {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    async fn execute(&self, _task: &Task, cancel: &CancellationToken) -> TaskResult {
        tokio::select! {
            permit = self.gate.acquire() => {
                permit.unwrap().forget();
                TaskResult::success("released")
            }
            () = cancel.cancelled() => TaskResult {
                status: "cancelled".to_string(),
                error: "cancelled".to_string(),
                exit_code: -1,
                ..TaskResult::default()
            },
        }
    }
}

/// In-memory board that yields inside every listing so concurrent callers
/// interleave. Optionally finishes one task right after it is listed as
/// "doing", as if its run completed mid-scan.
#[derive(Default)]
struct InterleavingStore {
    inner: InMemoryBoardStore,
    finish_after_listing: Option<String>,
}

#[async_trait]
impl BoardStore for InterleavingStore {
    async fn create_task(&self, task: NewTask) -> Result<BoardTask, BoardError> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: &str) -> Result<BoardTask, BoardError> {
        self.inner.get_task(id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<BoardTask>, BoardError> {
        let tasks = self.inner.list_tasks(filter).await?;
        tokio::task::yield_now().await;
        if filter.status == Some(BoardStatus::Doing) {
            if let Some(id) = &self.finish_after_listing {
                self.inner.move_task(id, BoardStatus::Done).await?;
            }
        }
        Ok(tasks)
    }

    async fn move_task(&self, id: &str, status: BoardStatus) -> Result<BoardTask, BoardError> {
        self.inner.move_task(id, status).await
    }

    async fn move_task_if(
        &self,
        id: &str,
        from: BoardStatus,
        to: BoardStatus,
    ) -> Result<Option<BoardTask>, BoardError> {
        self.inner.move_task_if(id, from, to).await
    }

    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<(), BoardError> {
        self.inner.add_comment(id, author, body).await
    }

    async fn comments(&self, id: &str) -> Result<Vec<Comment>, BoardError> {
        self.inner.comments(id).await
    }

    async fn assign_task(&self, id: &str, assignee: &str) -> Result<BoardTask, BoardError> {
        self.inner.assign_task(id, assignee).await
    }

    async fn record_run(&self, id: &str, stats: &RunStats) -> Result<(), BoardError> {
        self.inner.record_run(id, stats).await
    }

    async fn auto_retry_failed(&self, max_retries: u32) -> Result<usize, BoardError> {
        self.inner.auto_retry_failed(max_retries).await
    }

    async fn project_workdir(&self, project: &str) -> Result<Option<PathBuf>, BoardError> {
        self.inner.project_workdir(project).await
    }

    async fn set_project_workdir(&self, project: &str, workdir: PathBuf) -> Result<(), BoardError> {
        self.inner.set_project_workdir(project, workdir).await
    }
}

fn settings() -> DispatcherSettings {
    DispatcherSettings {
        max_retries: 0,
        ..DispatcherSettings::default()
    }
}

fn board(
    store: Arc<dyn BoardStore>,
    executor: Arc<dyn TaskExecutor>,
    settings: DispatcherSettings,
) -> Arc<TaskBoardDispatcher> {
    let dispatcher = Dispatcher::new(
        executor,
        Arc::new(ConcurrencyLimiter::new(4, 8)),
        Arc::new(SpawnTracker::new()),
        SpawnLimits::default(),
    );
    Arc::new(TaskBoardDispatcher::new(
        store,
        Arc::new(dispatcher),
        settings,
    ))
}

fn todo(title: &str, assignee: &str) -> NewTask {
    NewTask {
        title: title.to_string(),
        assignee: assignee.to_string(),
        status: Some(BoardStatus::Todo),
        ..NewTask::default()
    }
}

async fn wait_for_status(store: &dyn BoardStore, id: &str, status: BoardStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.get_task(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {status}"));
}

#[tokio::test]
async fn per_scan_cap_defers_remaining_tasks() {
    let store = Arc::new(InMemoryBoardStore::new());
    for title in ["one", "two", "three"] {
        store.create_task(todo(title, "coder")).await.unwrap();
    }
    let board = board(
        store.clone(),
        Arc::new(ScriptedExecutor::default()),
        DispatcherSettings {
            max_concurrent_tasks: 2,
            ..settings()
        },
    );

    let report = board.scan().await;
    assert_eq!(report.launched, 2);
    assert_eq!(report.deferred, 1);
    assert!(!report.skipped_busy);

    board.wait_idle().await;
    let all = store.list_tasks(&Default::default()).await.unwrap();
    let done = all.iter().filter(|t| t.status == BoardStatus::Done).count();
    let waiting = all.iter().filter(|t| t.status == BoardStatus::Todo).count();
    assert_eq!(done, 2);
    assert_eq!(waiting, 1);
}

#[tokio::test]
async fn unassigned_tasks_are_left_alone() {
    let store = Arc::new(InMemoryBoardStore::new());
    let task = store.create_task(todo("orphan", "")).await.unwrap();
    let executor = Arc::new(ScriptedExecutor::default());
    let board = board(store.clone(), executor.clone(), settings());

    let report = board.scan().await;
    assert_eq!(report.launched, 0);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.get_task(&task.id).await.unwrap().status,
        BoardStatus::Todo
    );
}

#[tokio::test]
async fn stuck_doing_task_is_reset_with_system_comment() {
    let store = Arc::new(InMemoryBoardStore::new());
    let stale = store
        .create_task(NewTask {
            status: Some(BoardStatus::Doing),
            ..todo("stale", "")
        })
        .await
        .unwrap();
    let fresh = store
        .create_task(NewTask {
            status: Some(BoardStatus::Doing),
            ..todo("fresh", "")
        })
        .await
        .unwrap();
    store
        .set_updated_at(&stale.id, unix_timestamp() - 3 * 3600)
        .await
        .unwrap();

    let board = board(
        store.clone(),
        Arc::new(ScriptedExecutor::default()),
        settings(),
    );
    let report = board.scan().await;
    assert_eq!(report.reset, 1);

    assert_eq!(
        store.get_task(&stale.id).await.unwrap().status,
        BoardStatus::Todo
    );
    assert_eq!(
        store.get_task(&fresh.id).await.unwrap().status,
        BoardStatus::Doing
    );

    let comments = store.comments(&stale.id).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].author, "system");
    assert!(
        comments[0]
            .body
            .starts_with("[auto-reset] Stuck in 'doing' for >2h0m0s"),
        "unexpected comment: {}",
        comments[0].body
    );
}

#[tokio::test]
async fn success_moves_to_done_and_comments_as_assignee() {
    let store = Arc::new(InMemoryBoardStore::new());
    let task = store.create_task(todo("write docs", "writer")).await.unwrap();
    let board = board(
        store.clone(),
        Arc::new(ScriptedExecutor::default()),
        settings(),
    );

    board.scan().await;
    board.wait_idle().await;

    let task = store.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, BoardStatus::Done);
    assert!(task.completed_at.is_some());
    assert!((task.cost_usd - 0.25).abs() < f64::EPSILON);

    let comments = store.comments(&task.id).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].author, "writer");
    assert!(comments[0].body.starts_with("Task completed in "));
    assert!(comments[0].body.contains("(cost: $0.2500)"));
    assert!(comments[0].body.ends_with("did write docs"));
}

#[tokio::test]
async fn failure_comments_and_requeues_until_retries_run_out() {
    let store = Arc::new(InMemoryBoardStore::new());
    let task = store.create_task(todo("fail build", "coder")).await.unwrap();
    let board = board(
        store.clone(),
        Arc::new(ScriptedExecutor::default()),
        DispatcherSettings {
            max_retries: 1,
            ..settings()
        },
    );

    board.scan().await;
    board.wait_idle().await;

    let after_first = store.get_task(&task.id).await.unwrap();
    assert_eq!(after_first.status, BoardStatus::Todo);
    assert_eq!(after_first.retry_count, 1);

    board.scan().await;
    board.wait_idle().await;

    let after_second = store.get_task(&task.id).await.unwrap();
    assert_eq!(after_second.status, BoardStatus::Failed);
    assert_eq!(after_second.retry_count, 1);

    let comments = store.comments(&task.id).await.unwrap();
    assert_eq!(comments.len(), 2);
    assert!(comments[0].body.starts_with("Task failed (exit code: 2, duration: "));
    assert!(comments[0].body.ends_with("compile error"));
}

#[tokio::test]
async fn executor_panic_marks_task_failed() {
    let store = Arc::new(InMemoryBoardStore::new());
    let task = store.create_task(todo("panic now", "coder")).await.unwrap();
    let board = board(
        store.clone(),
        Arc::new(ScriptedExecutor::default()),
        settings(),
    );

    board.scan().await;
    board.wait_idle().await;

    assert_eq!(board.active_count(), 0);
    assert_eq!(
        store.get_task(&task.id).await.unwrap().status,
        BoardStatus::Failed
    );
    let comments = store.comments(&task.id).await.unwrap();
    assert!(comments[0].body.contains("executor exploded"));
}

#[tokio::test]
async fn scan_waits_for_previous_batch() {
    let store = Arc::new(InMemoryBoardStore::new());
    let first = store.create_task(todo("first", "coder")).await.unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let board = board(
        store.clone(),
        Arc::new(GatedExecutor { gate: gate.clone() }),
        settings(),
    );

    assert_eq!(board.scan().await.launched, 1);
    let second = store.create_task(todo("second", "coder")).await.unwrap();

    let busy = board.scan().await;
    assert!(busy.skipped_busy);
    assert_eq!(busy.launched, 0);
    assert_eq!(
        store.get_task(&second.id).await.unwrap().status,
        BoardStatus::Todo
    );

    gate.add_permits(1);
    board.wait_idle().await;
    assert_eq!(
        store.get_task(&first.id).await.unwrap().status,
        BoardStatus::Done
    );

    assert_eq!(board.scan().await.launched, 1);
    gate.add_permits(1);
    board.wait_idle().await;
    assert_eq!(
        store.get_task(&second.id).await.unwrap().status,
        BoardStatus::Done
    );
}

#[tokio::test]
async fn drained_batch_triggers_immediate_rescan() {
    let store = Arc::new(InMemoryBoardStore::new());
    let a = store.create_task(todo("a", "coder")).await.unwrap();
    let b = store.create_task(todo("b", "coder")).await.unwrap();
    let board = board(
        store.clone(),
        Arc::new(ScriptedExecutor::default()),
        DispatcherSettings {
            interval: Duration::from_secs(3600),
            max_concurrent_tasks: 1,
            ..settings()
        },
    );

    assert_eq!(board.scan().await.deferred, 1);
    assert!(board.start());

    wait_for_status(store.as_ref(), &a.id, BoardStatus::Done).await;
    wait_for_status(store.as_ref(), &b.id, BoardStatus::Done).await;

    board.stop().await;
}

#[tokio::test]
async fn start_is_idempotent_and_stop_cancels_in_flight_work() {
    let store = Arc::new(InMemoryBoardStore::new());
    let task = store.create_task(todo("long", "coder")).await.unwrap();
    let board = board(
        store.clone(),
        Arc::new(GatedExecutor {
            gate: Arc::new(Semaphore::new(0)),
        }),
        DispatcherSettings {
            interval: Duration::from_millis(20),
            ..settings()
        },
    );

    assert!(board.start());
    assert!(!board.start());
    assert!(board.is_running());

    wait_for_status(store.as_ref(), &task.id, BoardStatus::Doing).await;

    board.stop().await;
    assert!(!board.is_running());
    assert_eq!(board.active_count(), 0);
    assert_eq!(
        store.get_task(&task.id).await.unwrap().status,
        BoardStatus::Failed
    );

    assert!(board.start());
    board.stop().await;
}

#[tokio::test]
async fn sqlite_board_runs_through_dispatcher() {
    let db = Database::open_in_memory().await.unwrap();
    let store: Arc<dyn BoardStore> = Arc::new(db);
    let task = store.create_task(todo("persisted", "coder")).await.unwrap();
    let board = board(
        Arc::clone(&store),
        Arc::new(ScriptedExecutor::default()),
        settings(),
    );

    assert_eq!(board.scan().await.launched, 1);
    board.wait_idle().await;

    let task = store.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, BoardStatus::Done);
    let comments = store.comments(&task.id).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].author, "coder");
}

#[tokio::test]
async fn overlapping_scans_launch_a_task_once() {
    let store = Arc::new(InterleavingStore::default());
    let task = store.create_task(todo("once", "coder")).await.unwrap();
    let executor = Arc::new(ScriptedExecutor::default());
    let board = board(store.clone(), executor.clone(), settings());

    let (first, second) = tokio::join!(board.scan(), board.scan());
    assert_eq!(first.launched + second.launched, 1, "{first:?} {second:?}");

    board.wait_idle().await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.get_task(&task.id).await.unwrap().status,
        BoardStatus::Done
    );
    assert_eq!(store.comments(&task.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stuck_reset_leaves_task_that_finished_meanwhile() {
    let inner = InMemoryBoardStore::new();
    let task = inner
        .create_task(NewTask {
            status: Some(BoardStatus::Doing),
            ..todo("late", "")
        })
        .await
        .unwrap();
    inner
        .set_updated_at(&task.id, unix_timestamp() - 3 * 3600)
        .await
        .unwrap();
    let store = Arc::new(InterleavingStore {
        inner,
        finish_after_listing: Some(task.id.clone()),
    });

    let board = board(
        store.clone(),
        Arc::new(ScriptedExecutor::default()),
        settings(),
    );
    let report = board.scan().await;
    assert_eq!(report.reset, 0);
    assert_eq!(
        store.get_task(&task.id).await.unwrap().status,
        BoardStatus::Done
    );
    assert!(store.comments(&task.id).await.unwrap().is_empty());
}
