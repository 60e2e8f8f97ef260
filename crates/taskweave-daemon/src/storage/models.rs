//! Row types for the board tables.

use crate::board::{BoardError, BoardStatus, BoardTask, Comment};

/// `board_tasks` row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BoardTaskRow {
    pub id: String,
    pub project: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub assignee: String,
    pub priority: String,
    pub model: Option<String>,
    pub budget: Option<f64>,
    /// JSON array of task ids.
    pub depends_on: String,
    pub retry_count: i64,
    pub cost_usd: f64,
    pub duration_ms: i64,
    pub session_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl TryFrom<BoardTaskRow> for BoardTask {
    type Error = BoardError;

    fn try_from(row: BoardTaskRow) -> Result<Self, Self::Error> {
        let depends_on = if row.depends_on.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&row.depends_on).unwrap_or_default()
        };
        Ok(Self {
            status: row.status.parse::<BoardStatus>()?,
            id: row.id,
            project: row.project,
            title: row.title,
            description: row.description,
            assignee: row.assignee,
            priority: row.priority,
            model: row.model.filter(|m| !m.is_empty()),
            budget: row.budget,
            depends_on,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            cost_usd: row.cost_usd,
            duration_ms: u64::try_from(row.duration_ms).unwrap_or(0),
            session_id: row.session_id.filter(|s| !s.is_empty()),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// `board_comments` row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommentRow {
    pub id: i64,
    pub task_id: String,
    pub author: String,
    pub body: String,
    pub created_at: i64,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Self {
            id: row.id,
            task_id: row.task_id,
            author: row.author,
            body: row.body,
            created_at: row.created_at,
        }
    }
}
