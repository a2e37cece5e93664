//! Job lifecycle events.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late subscribers can catch up.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::JobError;
use crate::ids::{BatchId, JobId};
use crate::job::JobKind;

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    JobQueued {
        job_id: JobId,
        kind: JobKind,
    },
    JobStarted {
        job_id: JobId,
        attempt: u32,
        worker: String,
    },
    JobProgress {
        job_id: JobId,
        progress: f32,
    },
    JobRetrying {
        job_id: JobId,
        attempt: u32,
        error: JobError,
    },
    JobSucceeded {
        job_id: JobId,
    },
    JobFailed {
        job_id: JobId,
        error: JobError,
    },
    JobCanceled {
        job_id: JobId,
    },
    BatchCreated {
        batch_id: BatchId,
        children: usize,
    },
}

impl EventPayload {
    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EventPayload::JobQueued { job_id, .. }
            | EventPayload::JobStarted { job_id, .. }
            | EventPayload::JobProgress { job_id, .. }
            | EventPayload::JobRetrying { job_id, .. }
            | EventPayload::JobSucceeded { job_id }
            | EventPayload::JobFailed { job_id, .. }
            | EventPayload::JobCanceled { job_id } => Some(*job_id),
            EventPayload::BatchCreated { .. } => None,
        }
    }

    /// Whether the job reached a terminal state with this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::JobSucceeded { .. }
                | EventPayload::JobFailed { .. }
                | EventPayload::JobCanceled { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// `capacity` is the broadcast channel buffer; the ring buffer is
    /// always [`MAX_RECENT_EVENTS`].
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn broadcast_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let job_id = JobId::new();
        bus.broadcast(EventPayload::JobQueued {
            job_id,
            kind: JobKind::Thumbnail,
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload.job_id(), Some(job_id));
        assert!(!event.payload.is_terminal());
    }

    #[test]
    fn recent_events_capped() {
        let bus = EventBus::new(256);
        let job_id = JobId::new();
        for _ in 0..150 {
            bus.broadcast(EventPayload::JobSucceeded { job_id });
        }
        assert_eq!(bus.recent_events(200).len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn recent_events_newest_first() {
        let bus = EventBus::new(16);
        for _ in 0..10 {
            bus.broadcast(EventPayload::JobProgress {
                job_id: JobId::new(),
                progress: 0.5,
            });
        }
        bus.broadcast(EventPayload::BatchCreated {
            batch_id: BatchId::new(),
            children: 3,
        });

        let recent = bus.recent_events(3);
        assert_eq!(recent.len(), 3);
        assert!(matches!(recent[0].payload, EventPayload::BatchCreated { .. }));
        assert_eq!(recent[0].payload.job_id(), None);
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.broadcast(EventPayload::JobFailed {
            job_id: JobId::new(),
            error: JobError::new(ErrorKind::Timeout, "slow"),
        });
        assert_eq!(bus.recent_events(1).len(), 1);
    }

    #[test]
    fn payload_wire_tag() {
        let json = serde_json::to_value(EventPayload::JobCanceled {
            job_id: JobId::new(),
        })
        .unwrap();
        assert_eq!(json["type"], "job_canceled");
    }
}
