//! Hostplane Store: SQLite instance records, status audit and task queue.

pub mod queue;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use sqlite::SqliteStore;
pub use types::*;
