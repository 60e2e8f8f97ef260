//! Database queries for the task board tables.

use std::path::PathBuf;

use async_trait::async_trait;

use taskweave_core::db::unix_timestamp;

use crate::board::{
    BoardError, BoardStatus, BoardStore, BoardTask, Comment, DEFAULT_PROJECT, NewTask, RunStats,
    TaskFilter,
};

use super::db::Database;
use super::models::{BoardTaskRow, CommentRow};

const LIST_SQL: &str = r"
    SELECT * FROM board_tasks
    WHERE (?1 IS NULL OR status = ?1)
      AND (?2 IS NULL OR assignee = ?2)
      AND (?3 IS NULL OR project = ?3)
    ORDER BY
        CASE priority
            WHEN 'urgent' THEN 1
            WHEN 'high' THEN 2
            WHEN 'normal' THEN 3
            WHEN 'low' THEN 4
            ELSE 5
        END,
        created_at DESC,
        rowid DESC
    LIMIT 100
";

impl Database {
    // =========================================================================
    // Task rows
    // =========================================================================

    async fn fetch_task(&self, id: &str) -> Result<Option<BoardTask>, BoardError> {
        sqlx::query_as::<_, BoardTaskRow>("SELECT * FROM board_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .map(BoardTask::try_from)
            .transpose()
    }

    async fn require_task(&self, id: &str) -> Result<BoardTask, BoardError> {
        self.fetch_task(id)
            .await?
            .ok_or_else(|| BoardError::NotFound { id: id.to_string() })
    }

    async fn check_dependencies(&self, task: &BoardTask) -> Result<(), BoardError> {
        for dep in &task.depends_on {
            let dep_task = self
                .fetch_task(dep)
                .await?
                .ok_or_else(|| BoardError::DependencyMissing {
                    dependency: dep.clone(),
                })?;
            if dep_task.status != BoardStatus::Done {
                return Err(BoardError::DependencyPending {
                    dependency: dep.clone(),
                    status: dep_task.status.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Persist a status change. With `expected` set, the row only changes if
    /// it still holds that status.
    async fn write_status(
        &self,
        task: BoardTask,
        expected: Option<BoardStatus>,
        status: BoardStatus,
    ) -> Result<Option<BoardTask>, BoardError> {
        if status == BoardStatus::Doing {
            self.check_dependencies(&task).await?;
        }

        let now = unix_timestamp();
        let completed_at = (status == BoardStatus::Done).then_some(now);
        let result = sqlx::query(
            r"
            UPDATE board_tasks SET status = ?1, updated_at = ?2, completed_at = ?3
            WHERE id = ?4 AND (?5 IS NULL OR status = ?5)
            ",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(completed_at)
        .bind(&task.id)
        .bind(expected.map(BoardStatus::as_str))
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(BoardTask {
            status,
            updated_at: now,
            completed_at,
            ..task
        }))
    }

    /// Number of tasks per status, for status reporting.
    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>, BoardError> {
        Ok(sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM board_tasks GROUP BY status ORDER BY status",
        )
        .fetch_all(self.pool())
        .await?)
    }
}

#[async_trait]
impl BoardStore for Database {
    async fn create_task(&self, new: NewTask) -> Result<BoardTask, BoardError> {
        let now = unix_timestamp();
        let id = new
            .id
            .unwrap_or_else(|| format!("task-{}", uuid::Uuid::new_v4().simple()));
        let project = new
            .project
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        let priority = new
            .priority
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "normal".to_string());
        let status = new.status.unwrap_or(BoardStatus::Backlog);
        let depends_on = serde_json::to_string(&new.depends_on).map_err(|e| {
            BoardError::Database(crate::storage::DatabaseError::Query(e.to_string()))
        })?;

        sqlx::query(
            r"
            INSERT INTO board_tasks
                (id, project, title, description, status, assignee, priority,
                 model, budget, depends_on, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&id)
        .bind(&project)
        .bind(&new.title)
        .bind(&new.description)
        .bind(status.as_str())
        .bind(&new.assignee)
        .bind(&priority)
        .bind(new.model.as_deref().filter(|m| !m.is_empty()))
        .bind(new.budget)
        .bind(&depends_on)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.require_task(&id).await
    }

    async fn get_task(&self, id: &str) -> Result<BoardTask, BoardError> {
        self.require_task(id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<BoardTask>, BoardError> {
        sqlx::query_as::<_, BoardTaskRow>(LIST_SQL)
            .bind(filter.status.map(BoardStatus::as_str))
            .bind(filter.assignee.as_deref())
            .bind(filter.project.as_deref())
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(BoardTask::try_from)
            .collect()
    }

    async fn move_task(&self, id: &str, status: BoardStatus) -> Result<BoardTask, BoardError> {
        let task = self.require_task(id).await?;
        self.write_status(task, None, status)
            .await?
            .ok_or_else(|| BoardError::NotFound { id: id.to_string() })
    }

    async fn move_task_if(
        &self,
        id: &str,
        from: BoardStatus,
        to: BoardStatus,
    ) -> Result<Option<BoardTask>, BoardError> {
        let task = self.require_task(id).await?;
        if task.status != from {
            return Ok(None);
        }
        self.write_status(task, Some(from), to).await
    }

    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<(), BoardError> {
        // Surface a missing task as NotFound rather than a foreign-key failure.
        self.require_task(id).await?;
        sqlx::query(
            "INSERT INTO board_comments (task_id, author, body, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(author)
        .bind(body)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn comments(&self, id: &str) -> Result<Vec<Comment>, BoardError> {
        let rows = sqlx::query_as::<_, CommentRow>(
            "SELECT * FROM board_comments WHERE task_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Comment::from).collect())
    }

    async fn assign_task(&self, id: &str, assignee: &str) -> Result<BoardTask, BoardError> {
        let result = sqlx::query("UPDATE board_tasks SET assignee = ?, updated_at = ? WHERE id = ?")
            .bind(assignee)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(BoardError::NotFound { id: id.to_string() });
        }
        self.require_task(id).await
    }

    async fn record_run(&self, id: &str, stats: &RunStats) -> Result<(), BoardError> {
        let result = sqlx::query(
            r"
            UPDATE board_tasks
            SET cost_usd = ?, duration_ms = ?, session_id = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(stats.cost_usd)
        .bind(i64::try_from(stats.duration_ms).unwrap_or(i64::MAX))
        .bind(stats.session_id.as_deref())
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(BoardError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn auto_retry_failed(&self, max_retries: u32) -> Result<usize, BoardError> {
        let result = sqlx::query(
            r"
            UPDATE board_tasks
            SET status = 'todo', retry_count = retry_count + 1, updated_at = ?
            WHERE status = 'failed' AND retry_count < ?
            ",
        )
        .bind(unix_timestamp())
        .bind(i64::from(max_retries))
        .execute(self.pool())
        .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn project_workdir(&self, project: &str) -> Result<Option<PathBuf>, BoardError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT workdir FROM projects WHERE name = ?")
            .bind(project)
            .fetch_optional(self.pool())
            .await?;
        Ok(row
            .map(|(workdir,)| workdir)
            .filter(|w| !w.is_empty())
            .map(PathBuf::from))
    }

    async fn set_project_workdir(&self, project: &str, workdir: PathBuf) -> Result<(), BoardError> {
        sqlx::query(
            r"
            INSERT INTO projects (name, workdir, created_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET workdir = excluded.workdir
            ",
        )
        .bind(project)
        .bind(workdir.to_string_lossy().into_owned())
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
