//! In-process job queue shared by the worker pool.
//!
//! The queue only holds job ids; the store is the source of truth for job
//! state. One FIFO lane per [`Priority`], drained high first. Waiting
//! workers are woken through a [`Notify`].

use std::collections::VecDeque;

use mf_core::{JobId, Priority};
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct Lanes {
    lanes: [VecDeque<JobId>; 3],
    closed: bool,
}

impl Lanes {
    fn pop_front(&mut self) -> Option<JobId> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<Lanes>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` to its priority lane. Returns `false` once the queue is
    /// closed.
    pub fn push(&self, id: JobId, priority: Priority) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.lanes[priority.rank()].push_back(id);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next id. Returns `None` when the queue is closed.
    pub async fn pop(&self) -> Option<JobId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(id) = inner.pop_front() {
                    if inner.len() > 0 {
                        self.notify.notify_one();
                    }
                    return Some(id);
                }
            }

            notified.await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<JobId> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.pop_front()
    }

    /// Drop `id` from whichever lane holds it.
    pub fn remove(&self, id: JobId) -> bool {
        let mut inner = self.inner.lock();
        for lane in inner.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|queued| *queued == id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.inner.lock().lanes.iter().any(|lane| lane.contains(&id))
    }

    /// Stop accepting pushes and release every waiting `pop`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_within_priority_high_first() {
        let queue = JobQueue::new();
        let (a, b, c, d) = (JobId::new(), JobId::new(), JobId::new(), JobId::new());
        queue.push(a, Priority::Normal);
        queue.push(b, Priority::Low);
        queue.push(c, Priority::High);
        queue.push(d, Priority::Normal);

        let order: Vec<JobId> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(order, vec![c, a, d, b]);
    }

    #[test]
    fn pop_is_pending_until_push() {
        let queue = JobQueue::new();
        let id = JobId::new();
        let mut pop = tokio_test::task::spawn(queue.pop());
        tokio_test::assert_pending!(pop.poll());

        queue.push(id, Priority::Low);
        assert!(pop.is_woken());
        tokio_test::assert_ready_eq!(pop.poll(), Some(id));
    }

    #[test]
    fn remove_drops_queued_id() {
        let queue = JobQueue::new();
        let (a, b) = (JobId::new(), JobId::new());
        queue.push(a, Priority::Normal);
        queue.push(b, Priority::Normal);

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert!(!queue.contains(a));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(b));
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(JobQueue::new());
        let id = JobId::new();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(id, Priority::Low);

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(id));
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let queue = Arc::new(JobQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        for waiter in waiters {
            let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(popped, None);
        }
        assert!(!queue.push(JobId::new(), Priority::High));
    }

    #[tokio::test]
    async fn burst_wakes_every_idle_worker() {
        let queue = Arc::new(JobQueue::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..4 {
            queue.push(JobId::new(), Priority::Normal);
        }
        for waiter in waiters {
            let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(popped.is_some());
        }
        assert!(queue.is_empty());
    }
}
