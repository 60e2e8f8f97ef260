//! `SQLite` storage for the Taskweave daemon.
//!
//! Persists board tasks, their comments and project working directories.

mod board_queries;
mod db;
mod models;

pub use db::{Database, DatabaseError};
pub use models::{BoardTaskRow, CommentRow};
