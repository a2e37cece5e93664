//! mf-db: persistence for mediaforge job and batch records.
//!
//! [`JobStore`] is the seam the orchestrator talks to. Two backends are
//! provided: [`MemoryJobStore`] for a single process, and [`SqliteJobStore`]
//! with an r2d2 connection pool and embedded migrations for records that
//! should survive a restart.

pub mod memory;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod sqlite;
pub mod store;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::{Created, JobStore};
