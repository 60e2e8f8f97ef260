//! Taskweave Core Library
//!
//! Shared functionality for Taskweave components:
//! - Configuration resolution and hierarchy
//! - Go-style duration strings used by config and workflow documents
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Common error types and tracing setup

pub mod config;
pub mod db;
pub mod duration;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
