//! Query modules, one per table.

pub mod batches;
pub mod jobs;
