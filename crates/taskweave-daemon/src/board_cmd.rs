//! `taskweave-daemon board ...` subcommands.

use std::path::PathBuf;

use tracing::info;

use taskweave_daemon::board::{BoardStatus, BoardStore, NewTask, TaskFilter};
use taskweave_daemon::storage::Database;

/// Task board subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum BoardAction {
    /// Create a task. Tasks default to `todo` so the dispatcher picks them up.
    Add {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Agent that runs the task; unassigned tasks are never dispatched.
        #[arg(long, default_value = "")]
        assignee: String,

        #[arg(long)]
        project: Option<String>,

        /// urgent, high, normal or low
        #[arg(long)]
        priority: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Spending cap in USD
        #[arg(long)]
        budget: Option<f64>,

        /// Initial status (backlog, todo, ...)
        #[arg(long, value_parser = parse_status)]
        status: Option<BoardStatus>,

        /// IDs of tasks that must be done before this one can start. Repeatable.
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },

    /// List tasks ordered by priority, newest first.
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<BoardStatus>,

        #[arg(long)]
        assignee: Option<String>,

        #[arg(long)]
        project: Option<String>,
    },

    /// Show a task and its comments.
    Show { id: String },

    /// Move a task to another status.
    Move {
        id: String,
        #[arg(value_parser = parse_status)]
        status: BoardStatus,
    },

    /// Register the working directory agents run in for a project.
    SetWorkdir { project: String, workdir: PathBuf },
}

fn parse_status(raw: &str) -> Result<BoardStatus, String> {
    raw.parse::<BoardStatus>().map_err(|e| e.to_string())
}

/// Execute the `board` subcommand.
#[allow(clippy::print_stdout)]
pub async fn run(action: BoardAction, db: &Database) -> anyhow::Result<()> {
    match action {
        BoardAction::Add {
            title,
            description,
            assignee,
            project,
            priority,
            model,
            budget,
            status,
            depends_on,
        } => {
            let task = db
                .create_task(NewTask {
                    id: None,
                    project,
                    title,
                    description,
                    status: Some(status.unwrap_or(BoardStatus::Todo)),
                    assignee,
                    priority,
                    model,
                    budget,
                    depends_on,
                })
                .await?;
            info!(task_id = %task.id, status = %task.status, "Task created");
            println!("{}", task.id);
        }
        BoardAction::List {
            status,
            assignee,
            project,
        } => {
            let filter = TaskFilter {
                status,
                assignee,
                project,
            };
            for task in db.list_tasks(&filter).await? {
                let assignee = if task.assignee.is_empty() {
                    "-"
                } else {
                    task.assignee.as_str()
                };
                println!(
                    "{}  {:<8} {:<7} {:<12} {}",
                    task.id,
                    task.status.as_str(),
                    task.priority,
                    assignee,
                    task.title
                );
            }
        }
        BoardAction::Show { id } => {
            let task = db.get_task(&id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            for comment in db.comments(&id).await? {
                println!("\n[{}] {}:\n{}", comment.created_at, comment.author, comment.body);
            }
        }
        BoardAction::Move { id, status } => {
            let task = db.move_task(&id, status).await?;
            info!(task_id = %task.id, status = %task.status, "Task moved");
        }
        BoardAction::SetWorkdir { project, workdir } => {
            db.set_project_workdir(&project, workdir).await?;
            info!(project = %project, "Project working directory set");
        }
    }
    Ok(())
}
