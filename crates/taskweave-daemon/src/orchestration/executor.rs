//! Task invocation contract.
//!
//! A [`Task`] is one agent invocation request; a [`TaskExecutor`] runs it and
//! reports a [`TaskResult`]. Executors signal failure through the result's
//! status and error fields, never by returning early or panicking (panics are
//! still caught by the callers that launch executions).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// One agent invocation request.
///
/// Depth and parent are fixed at construction: top-level tasks come from
/// [`Task::new`], nested ones from [`Task::child_of`].
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: String,
    name: String,
    prompt: String,
    agent: String,
    model: Option<String>,
    depth: u32,
    parent_id: String,
    session_id: Option<String>,
    workdir: Option<PathBuf>,
    budget: Option<f64>,
    timeout: Option<Duration>,
    source: String,
}

impl Task {
    /// A top-level task (depth 0, no parent).
    pub fn new(prompt: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            name: format!("task:{id}"),
            id,
            prompt: prompt.into(),
            agent: String::new(),
            model: None,
            depth: 0,
            parent_id: String::new(),
            session_id: None,
            workdir: None,
            budget: None,
            timeout: None,
            source: String::new(),
        }
    }

    /// A nested task spawned by `parent`, one level deeper.
    ///
    /// Inherits the parent's working directory and session linkage.
    pub fn child_of(parent: &Self, prompt: impl Into<String>) -> Self {
        let mut child = Self::new(prompt);
        child.depth = parent.depth + 1;
        child.parent_id.clone_from(&parent.id);
        child.workdir.clone_from(&parent.workdir);
        child.session_id.clone_from(&parent.session_id);
        child.source = "spawn".to_string();
        child
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.is_empty());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    #[must_use]
    pub fn with_workdir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Option<f64>) -> Self {
        self.budget = budget.filter(|b| *b > 0.0);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Empty for top-level tasks.
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub const fn budget(&self) -> Option<f64> {
        self.budget
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// `"success"`, `"error"`, `"timeout"` or `"cancelled"`. Failures carry
    /// error text or a non-zero exit code.
    pub status: String,
    pub output: String,
    pub error: String,
    pub cost: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub exit_code: i32,
}

impl TaskResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>, exit_code: i32) -> Self {
        Self {
            status: "error".to_string(),
            error: error.into(),
            exit_code,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    #[must_use]
    pub const fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// A `"success"` status, or a zero exit code with no error text.
    pub fn is_success(&self) -> bool {
        self.status == "success" || (self.exit_code == 0 && self.error.is_empty())
    }

    /// Error text for failure reporting, falling back to the output.
    pub fn failure_text(&self) -> &str {
        if self.error.is_empty() {
            &self.output
        } else {
            &self.error
        }
    }
}

/// Runs agent invocations. Must be safe to call concurrently.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task`. Implementations should stop early when `cancel` fires
    /// and report `status = "cancelled"`.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskResult;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_top_level() {
        let task = Task::new("do it");
        assert_eq!(task.depth(), 0);
        assert_eq!(task.parent_id(), "");
        assert!(task.name().starts_with("task:"));
        assert!(!task.id().is_empty());
    }

    #[test]
    fn child_is_one_level_deeper() {
        let parent = Task::new("parent")
            .with_id("p-1")
            .with_workdir(Some(PathBuf::from("/repo")))
            .with_session(Some("sess".into()));
        let child = Task::child_of(&parent, "child");
        assert_eq!(child.depth(), 1);
        assert_eq!(child.parent_id(), "p-1");
        assert_eq!(child.workdir(), Some(Path::new("/repo")));
        assert_eq!(child.session_id(), Some("sess"));
        assert_eq!(child.source(), "spawn");

        let grandchild = Task::child_of(&child, "grandchild");
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.parent_id(), child.id());
    }

    #[test]
    fn empty_model_and_zero_budget_are_unset() {
        let task = Task::new("x")
            .with_model(Some(String::new()))
            .with_budget(Some(0.0));
        assert_eq!(task.model(), None);
        assert_eq!(task.budget(), None);
    }

    #[test]
    fn success_rules() {
        assert!(TaskResult::success("ok").is_success());
        assert!(!TaskResult::failure("boom", 1).is_success());
        // Error text fails a zero exit code.
        assert!(!TaskResult::failure("boom", 0).is_success());

        let clean_exit = TaskResult {
            status: "error".into(),
            exit_code: 0,
            ..TaskResult::default()
        };
        assert!(clean_exit.is_success());

        let by_exit = TaskResult {
            exit_code: 0,
            ..TaskResult::default()
        };
        assert!(by_exit.is_success());

        let nonzero = TaskResult {
            exit_code: 2,
            ..TaskResult::default()
        };
        assert!(!nonzero.is_success());
    }

    #[test]
    fn failure_text_falls_back_to_output() {
        let mut result = TaskResult::failure("", 1);
        result.output = "partial output".into();
        assert_eq!(result.failure_text(), "partial output");
        result.error = "real error".into();
        assert_eq!(result.failure_text(), "real error");
    }
}
