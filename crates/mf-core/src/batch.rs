//! Batch records and the fan-in rule that derives a batch's state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BatchId, JobId};
use crate::job::{JobKind, JobState};
use crate::params::Params;

/// Parent of a set of sibling jobs submitted together.
///
/// The batch never stores a state of its own; see [`aggregate_state`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub kind: JobKind,
    pub params: Params,
    /// Children in submission order.
    pub child_ids: Vec<JobId>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(kind: JobKind, params: Params) -> Self {
        Self {
            id: BatchId::new(),
            kind,
            params,
            child_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Derived state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    Running,
    Succeeded,
    Failed,
    PartialFailure,
    Canceled,
}

impl AggregateState {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateState::Running => "running",
            AggregateState::Succeeded => "succeeded",
            AggregateState::Failed => "failed",
            AggregateState::PartialFailure => "partial_failure",
            AggregateState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, AggregateState::Running)
    }
}

impl fmt::Display for AggregateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fold child states into the batch state.
///
/// Any unfinished child keeps the batch running. Once every child is
/// terminal, a canceled child counts as "not succeeded":
///
/// | succeeded | failed | canceled | result |
/// |-----------|--------|----------|--------|
/// | all       | 0      | 0        | succeeded |
/// | >0        | any    | any (not all zero failed+canceled) | partial_failure |
/// | 0         | >0     | any      | failed |
/// | 0         | 0      | all      | canceled |
///
/// An empty batch is vacuously `succeeded`.
pub fn aggregate_state<I>(states: I) -> AggregateState
where
    I: IntoIterator<Item = JobState>,
{
    let (mut succeeded, mut failed, mut canceled) = (0usize, 0usize, 0usize);
    for state in states {
        match state {
            JobState::Queued | JobState::Running => return AggregateState::Running,
            JobState::Succeeded => succeeded += 1,
            JobState::Failed => failed += 1,
            JobState::Canceled => canceled += 1,
        }
    }

    match (succeeded, failed, canceled) {
        (_, 0, 0) => AggregateState::Succeeded,
        (0, 0, _) => AggregateState::Canceled,
        (0, _, _) => AggregateState::Failed,
        _ => AggregateState::PartialFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobState::*;

    #[test]
    fn any_unfinished_child_means_running() {
        assert_eq!(aggregate_state([Succeeded, Queued, Failed]), AggregateState::Running);
        assert_eq!(aggregate_state([Running]), AggregateState::Running);
    }

    #[test]
    fn all_succeeded() {
        assert_eq!(aggregate_state([Succeeded, Succeeded]), AggregateState::Succeeded);
    }

    #[test]
    fn mixed_success_and_failure_is_partial() {
        assert_eq!(
            aggregate_state([Succeeded, Succeeded, Failed]),
            AggregateState::PartialFailure
        );
    }

    #[test]
    fn all_failed() {
        assert_eq!(aggregate_state([Failed, Failed]), AggregateState::Failed);
    }

    #[test]
    fn canceled_children() {
        assert_eq!(aggregate_state([Canceled, Canceled]), AggregateState::Canceled);
        assert_eq!(
            aggregate_state([Canceled, Succeeded]),
            AggregateState::PartialFailure
        );
        assert_eq!(aggregate_state([Canceled, Failed]), AggregateState::Failed);
    }

    #[test]
    fn empty_batch_is_succeeded() {
        assert_eq!(aggregate_state([]), AggregateState::Succeeded);
    }

    #[test]
    fn wire_names() {
        let json = serde_json::to_string(&AggregateState::PartialFailure).unwrap();
        assert_eq!(json, "\"partial_failure\"");
        assert!(!AggregateState::Running.is_terminal());
    }
}
