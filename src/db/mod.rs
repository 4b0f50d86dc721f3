//! Database module: row models and SQL repositories for the batch job queue.
//!
//! - `model`: raw rows and their conversion into `crate::model::BatchJob`.
//! - `repo`: SQL-only functions over the `batch_jobs` table.
//!
//! Callers normally go through `crate::queue::SqliteJobQueue`; the repository
//! API is re-exported here for the operator tools and tests.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::JobRow;
