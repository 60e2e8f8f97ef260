//! In-process [`BoardStore`] for tests and ephemeral runs.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use taskweave_core::db::unix_timestamp;

use super::models::{
    BoardStatus, BoardTask, Comment, DEFAULT_PROJECT, LIST_LIMIT, NewTask, RunStats, TaskFilter,
    sort_for_listing,
};
use super::store::{BoardError, BoardStore};

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<String, BoardTask>,
    comments: Vec<Comment>,
    projects: HashMap<String, PathBuf>,
}

impl State {
    fn task_mut(&mut self, id: &str) -> Result<&mut BoardTask, BoardError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| BoardError::NotFound { id: id.to_string() })
    }

    /// Move `id` to `status`, or return `None` if it is not in `expected`.
    fn set_status(
        &mut self,
        id: &str,
        expected: Option<BoardStatus>,
        status: BoardStatus,
    ) -> Result<Option<BoardTask>, BoardError> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| BoardError::NotFound { id: id.to_string() })?;
        if expected.is_some_and(|from| task.status != from) {
            return Ok(None);
        }

        if status == BoardStatus::Doing {
            for dep in &task.depends_on {
                let dep_task = self.tasks.get(dep).ok_or_else(|| BoardError::DependencyMissing {
                    dependency: dep.clone(),
                })?;
                if dep_task.status != BoardStatus::Done {
                    return Err(BoardError::DependencyPending {
                        dependency: dep.clone(),
                        status: dep_task.status.to_string(),
                    });
                }
            }
        }

        let now = unix_timestamp();
        let task = self.task_mut(id)?;
        task.status = status;
        task.updated_at = now;
        task.completed_at = (status == BoardStatus::Done).then_some(now);
        Ok(Some(task.clone()))
    }
}

/// Board store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryBoardStore {
    state: RwLock<State>,
}

impl InMemoryBoardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a task's `updated_at`, e.g. to simulate a task orphaned long ago.
    pub async fn set_updated_at(&self, id: &str, updated_at: i64) -> Result<(), BoardError> {
        self.state.write().await.task_mut(id)?.updated_at = updated_at;
        Ok(())
    }
}

#[async_trait]
impl BoardStore for InMemoryBoardStore {
    async fn create_task(&self, new: NewTask) -> Result<BoardTask, BoardError> {
        let now = unix_timestamp();
        let task = BoardTask {
            id: new
                .id
                .unwrap_or_else(|| format!("task-{}", uuid::Uuid::new_v4().simple())),
            project: new
                .project
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
            title: new.title,
            description: new.description,
            status: new.status.unwrap_or(BoardStatus::Backlog),
            assignee: new.assignee,
            priority: new
                .priority
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "normal".to_string()),
            model: new.model.filter(|m| !m.is_empty()),
            budget: new.budget,
            depends_on: new.depends_on,
            retry_count: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            session_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.state
            .write()
            .await
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> Result<BoardTask, BoardError> {
        self.state
            .read()
            .await
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| BoardError::NotFound { id: id.to_string() })
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<BoardTask>, BoardError> {
        let mut tasks: Vec<BoardTask> = self
            .state
            .read()
            .await
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        sort_for_listing(&mut tasks);
        tasks.truncate(LIST_LIMIT);
        Ok(tasks)
    }

    async fn move_task(&self, id: &str, status: BoardStatus) -> Result<BoardTask, BoardError> {
        self.state
            .write()
            .await
            .set_status(id, None, status)?
            .ok_or_else(|| BoardError::NotFound { id: id.to_string() })
    }

    async fn move_task_if(
        &self,
        id: &str,
        from: BoardStatus,
        to: BoardStatus,
    ) -> Result<Option<BoardTask>, BoardError> {
        self.state.write().await.set_status(id, Some(from), to)
    }

    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<(), BoardError> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(id) {
            return Err(BoardError::NotFound { id: id.to_string() });
        }
        let next_id = i64::try_from(state.comments.len()).unwrap_or(i64::MAX) + 1;
        state.comments.push(Comment {
            id: next_id,
            task_id: id.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            created_at: unix_timestamp(),
        });
        Ok(())
    }

    async fn comments(&self, id: &str) -> Result<Vec<Comment>, BoardError> {
        Ok(self
            .state
            .read()
            .await
            .comments
            .iter()
            .filter(|c| c.task_id == id)
            .cloned()
            .collect())
    }

    async fn assign_task(&self, id: &str, assignee: &str) -> Result<BoardTask, BoardError> {
        let mut state = self.state.write().await;
        let task = state.task_mut(id)?;
        task.assignee = assignee.to_string();
        task.updated_at = unix_timestamp();
        Ok(task.clone())
    }

    async fn record_run(&self, id: &str, stats: &RunStats) -> Result<(), BoardError> {
        let mut state = self.state.write().await;
        let task = state.task_mut(id)?;
        task.cost_usd = stats.cost_usd;
        task.duration_ms = stats.duration_ms;
        task.session_id.clone_from(&stats.session_id);
        task.updated_at = unix_timestamp();
        Ok(())
    }

    async fn auto_retry_failed(&self, max_retries: u32) -> Result<usize, BoardError> {
        let mut state = self.state.write().await;
        let now = unix_timestamp();
        let mut retried = 0;
        for task in state.tasks.values_mut() {
            if task.status == BoardStatus::Failed && task.retry_count < max_retries {
                task.status = BoardStatus::Todo;
                task.retry_count += 1;
                task.updated_at = now;
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn project_workdir(&self, project: &str) -> Result<Option<PathBuf>, BoardError> {
        Ok(self.state.read().await.projects.get(project).cloned())
    }

    async fn set_project_workdir(&self, project: &str, workdir: PathBuf) -> Result<(), BoardError> {
        self.state
            .write()
            .await
            .projects
            .insert(project.to_string(), workdir);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            assignee: "coder".to_string(),
            status: Some(BoardStatus::Todo),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn create_applies_defaults() {
        let store = InMemoryBoardStore::new();
        let task = store
            .create_task(NewTask {
                title: "t".into(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        assert_eq!(task.status, BoardStatus::Backlog);
        assert_eq!(task.priority, "normal");
        assert_eq!(task.project, DEFAULT_PROJECT);
        assert!(task.id.starts_with("task-"));
    }

    #[tokio::test]
    async fn move_to_done_sets_completed_at() {
        let store = InMemoryBoardStore::new();
        let task = store.create_task(new_task("a")).await.unwrap();
        let moved = store.move_task(&task.id, BoardStatus::Done).await.unwrap();
        assert!(moved.completed_at.is_some());
        let reopened = store.move_task(&task.id, BoardStatus::Todo).await.unwrap();
        assert!(reopened.completed_at.is_none());
    }

    #[tokio::test]
    async fn move_to_doing_requires_done_dependencies() {
        let store = InMemoryBoardStore::new();
        let dep = store.create_task(new_task("dep")).await.unwrap();
        let mut blocked = new_task("blocked");
        blocked.depends_on = vec![dep.id.clone()];
        let blocked = store.create_task(blocked).await.unwrap();

        let err = store
            .move_task(&blocked.id, BoardStatus::Doing)
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::DependencyPending { .. }));

        store.move_task(&dep.id, BoardStatus::Done).await.unwrap();
        store.move_task(&blocked.id, BoardStatus::Doing).await.unwrap();
    }

    #[tokio::test]
    async fn conditional_move_only_applies_from_expected_status() {
        let store = InMemoryBoardStore::new();
        let task = store.create_task(new_task("claim")).await.unwrap();

        let claimed = store
            .move_task_if(&task.id, BoardStatus::Todo, BoardStatus::Doing)
            .await
            .unwrap();
        assert_eq!(claimed.unwrap().status, BoardStatus::Doing);

        let again = store
            .move_task_if(&task.id, BoardStatus::Todo, BoardStatus::Doing)
            .await
            .unwrap();
        assert!(again.is_none());

        store.move_task(&task.id, BoardStatus::Done).await.unwrap();
        let reset = store
            .move_task_if(&task.id, BoardStatus::Doing, BoardStatus::Todo)
            .await
            .unwrap();
        assert!(reset.is_none());
        assert_eq!(store.get_task(&task.id).await.unwrap().status, BoardStatus::Done);

        assert!(matches!(
            store
                .move_task_if("missing", BoardStatus::Todo, BoardStatus::Doing)
                .await,
            Err(BoardError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_dependency_blocks_start() {
        let store = InMemoryBoardStore::new();
        let mut t = new_task("orphan");
        t.depends_on = vec!["gone".into()];
        let t = store.create_task(t).await.unwrap();
        let err = store.move_task(&t.id, BoardStatus::Doing).await.unwrap_err();
        assert!(matches!(err, BoardError::DependencyMissing { .. }));
    }

    #[tokio::test]
    async fn auto_retry_respects_max() {
        let store = InMemoryBoardStore::new();
        let t = store.create_task(new_task("flaky")).await.unwrap();

        for round in 1..=2 {
            store.move_task(&t.id, BoardStatus::Failed).await.unwrap();
            assert_eq!(store.auto_retry_failed(2).await.unwrap(), 1);
            let t = store.get_task(&t.id).await.unwrap();
            assert_eq!(t.status, BoardStatus::Todo);
            assert_eq!(t.retry_count, round);
        }

        store.move_task(&t.id, BoardStatus::Failed).await.unwrap();
        assert_eq!(store.auto_retry_failed(2).await.unwrap(), 0);
        assert_eq!(
            store.get_task(&t.id).await.unwrap().status,
            BoardStatus::Failed
        );
    }

    #[tokio::test]
    async fn comments_and_unknown_task() {
        let store = InMemoryBoardStore::new();
        let t = store.create_task(new_task("c")).await.unwrap();
        store.add_comment(&t.id, "user", "first").await.unwrap();
        store.add_comment(&t.id, "coder", "second").await.unwrap();
        let comments = store.comments(&t.id).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].body, "first");

        assert!(matches!(
            store.add_comment("missing", "x", "y").await,
            Err(BoardError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn record_run_and_assign() {
        let store = InMemoryBoardStore::new();
        let t = store.create_task(new_task("r")).await.unwrap();
        store
            .record_run(
                &t.id,
                &RunStats {
                    cost_usd: 0.5,
                    duration_ms: 1200,
                    session_id: Some("s-9".into()),
                },
            )
            .await
            .unwrap();
        let t = store.assign_task(&t.id, "reviewer").await.unwrap();
        assert_eq!(t.assignee, "reviewer");
        assert_eq!(t.duration_ms, 1200);
        assert_eq!(t.session_id.as_deref(), Some("s-9"));
    }
}
