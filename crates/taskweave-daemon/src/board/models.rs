//! Board task model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::store::BoardError;

/// Kanban status of a board task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardStatus {
    Backlog,
    Todo,
    Doing,
    Review,
    Done,
    Failed,
}

impl BoardStatus {
    pub const ALL: [Self; 6] = [
        Self::Backlog,
        Self::Todo,
        Self::Doing,
        Self::Review,
        Self::Done,
        Self::Failed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Todo => "todo",
            Self::Doing => "doing",
            Self::Review => "review",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoardStatus {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BoardError::InvalidStatus {
                status: s.to_string(),
            })
    }
}

/// Sort rank of a priority label: urgent, high, normal, low, then anything else.
pub fn priority_rank(priority: &str) -> u8 {
    match priority {
        "urgent" => 1,
        "high" => 2,
        "normal" => 3,
        "low" => 4,
        _ => 5,
    }
}

/// A persisted unit of work on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardTask {
    pub id: String,
    pub project: String,
    pub title: String,
    pub description: String,
    pub status: BoardStatus,
    /// Agent name; empty means unassigned.
    pub assignee: String,
    pub priority: String,
    pub model: Option<String>,
    pub budget: Option<f64>,
    pub depends_on: Vec<String>,
    pub retry_count: u32,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl BoardTask {
    /// Prompt sent to the assignee: the title, plus the description when present.
    pub fn prompt(&self) -> String {
        if self.description.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.description)
        }
    }
}

/// Input for creating a board task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub id: Option<String>,
    pub project: Option<String>,
    pub title: String,
    pub description: String,
    pub status: Option<BoardStatus>,
    pub assignee: String,
    pub priority: Option<String>,
    pub model: Option<String>,
    pub budget: Option<f64>,
    pub depends_on: Vec<String>,
}

/// Filter for listing tasks. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<BoardStatus>,
    pub assignee: Option<String>,
    pub project: Option<String>,
}

impl TaskFilter {
    pub fn status(status: BoardStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &BoardTask) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.assignee.as_deref().is_none_or(|a| a == task.assignee)
            && self.project.as_deref().is_none_or(|p| p == task.project)
    }
}

/// Outcome linkage recorded after an invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub session_id: Option<String>,
}

/// A comment on a board task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub task_id: String,
    pub author: String,
    pub body: String,
    pub created_at: i64,
}

/// Maximum rows returned by a listing.
pub const LIST_LIMIT: usize = 100;

/// Project assigned to tasks created without one.
pub const DEFAULT_PROJECT: &str = "default";

/// Order tasks the way listings present them: priority rank, newest first.
pub fn sort_for_listing(tasks: &mut [BoardTask]) {
    tasks.sort_by(|a, b| {
        priority_rank(&a.priority)
            .cmp(&priority_rank(&b.priority))
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}
