//! mf-core: shared types for the mediaforge orchestrator.
//!
//! Typed identifiers, the job and batch records with their state rules,
//! conversion parameters, the error taxonomy, configuration types, and a
//! broadcast event bus. Every other mediaforge crate depends on this one.

pub mod batch;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod params;

pub use batch::{aggregate_state, AggregateState, Batch};
pub use error::{Error, ErrorKind, JobError, Result};
pub use ids::*;
pub use job::{BlobRef, Job, JobKind, JobState, Priority};
pub use params::{Params, RawParams};
