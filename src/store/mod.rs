//! Persistence layer: libSQL-backed storage for observations, tasks,
//! action state, retries, and behavior history.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ActionState, BehaviorEvent, Database, RetryEntry, RetryStatus, TaskRecord};
