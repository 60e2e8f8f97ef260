//! Database connection and initialization.

pub use taskweave_core::db::DatabaseError;

taskweave_core::define_database!(Database, "Board database migrations complete");
