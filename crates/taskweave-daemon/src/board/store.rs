//! Board persistence contract.
//!
//! The dispatcher only talks to the board through [`BoardStore`]. Two
//! implementations exist: the `SQLite`-backed [`crate::storage::Database`]
//! and [`super::memory::InMemoryBoardStore`].

use std::path::PathBuf;

use async_trait::async_trait;

use crate::storage::DatabaseError;

use super::models::{BoardStatus, BoardTask, Comment, NewTask, RunStats, TaskFilter};

/// Errors from board operations.
#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("task not found: {id}")]
    NotFound { id: String },

    #[error("invalid status: {status}")]
    InvalidStatus { status: String },

    #[error("dependency {dependency} (status: {status}) must be done before starting this task")]
    DependencyPending { dependency: String, status: String },

    #[error("dependency {dependency} not found")]
    DependencyMissing { dependency: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for BoardError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.into())
    }
}

/// Read/write contract for the task board.
///
/// Every call may fail; callers driving background work log failures and
/// move on to the next item.
#[async_trait]
pub trait BoardStore: Send + Sync {
    async fn create_task(&self, task: NewTask) -> Result<BoardTask, BoardError>;

    async fn get_task(&self, id: &str) -> Result<BoardTask, BoardError>;

    /// Tasks matching `filter`, ordered by priority then newest first, at most 100.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<BoardTask>, BoardError>;

    /// Change a task's status and bump `updated_at`.
    ///
    /// Moving to `doing` requires every dependency to be `done`; moving to
    /// `done` stamps `completed_at`.
    async fn move_task(&self, id: &str, status: BoardStatus) -> Result<BoardTask, BoardError>;

    /// [`move_task`](Self::move_task), applied only while the task is still
    /// in `from`. Returns `None` when the task is in any other status.
    async fn move_task_if(
        &self,
        id: &str,
        from: BoardStatus,
        to: BoardStatus,
    ) -> Result<Option<BoardTask>, BoardError>;

    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<(), BoardError>;

    /// Comments on a task, oldest first.
    async fn comments(&self, id: &str) -> Result<Vec<Comment>, BoardError>;

    async fn assign_task(&self, id: &str, assignee: &str) -> Result<BoardTask, BoardError>;

    /// Persist cost, duration and session linkage of the latest run.
    async fn record_run(&self, id: &str, stats: &RunStats) -> Result<(), BoardError>;

    /// Move failed tasks with `retry_count < max_retries` back to `todo`,
    /// incrementing their retry count. Returns how many were requeued.
    async fn auto_retry_failed(&self, max_retries: u32) -> Result<usize, BoardError>;

    /// Working directory registered for `project`, if any.
    async fn project_workdir(&self, project: &str) -> Result<Option<PathBuf>, BoardError>;

    async fn set_project_workdir(&self, project: &str, workdir: PathBuf) -> Result<(), BoardError>;
}
