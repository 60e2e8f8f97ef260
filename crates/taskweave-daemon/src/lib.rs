//! Taskweave Daemon Library
//!
//! Core functionality for the Taskweave daemon:
//! - Spawn admission and slot limiting for agent invocations
//! - Task board with a polling auto-dispatcher
//! - Workflow DAG engine and file-backed workflow store
//! - SQLite storage for board tasks and comments

pub mod board;
pub mod orchestration;
pub mod storage;
pub mod workflow;
