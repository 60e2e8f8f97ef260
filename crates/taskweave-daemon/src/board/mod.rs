//! Persistent task board and its polling dispatcher.

pub mod dispatcher;
pub mod memory;
pub mod models;
pub mod store;

pub use dispatcher::{DispatcherSettings, ScanReport, TaskBoardDispatcher};
pub use memory::InMemoryBoardStore;
pub use models::{
    BoardStatus, BoardTask, Comment, DEFAULT_PROJECT, LIST_LIMIT, NewTask, RunStats, TaskFilter,
};
pub use store::{BoardError, BoardStore};
