//! FIFO workload queue
//!
//! Multi-producer (informer callbacks), single consumer (the scheduler
//! worker). Entries are job references deduplicated by namespace and
//! name, so the queue is bounded by the live-job count.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Reference to one job awaiting (re)scheduling
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobRef {
    pub namespace: String,
    pub name: String,
}

impl JobRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<JobRef>,
    queued: HashSet<JobRef>,
}

/// Deduplicated FIFO queue of job references
#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job at the tail. Returns false when it was already queued.
    pub fn push(&self, job: JobRef) -> bool {
        let added = {
            let mut inner = self.inner.lock().expect("job queue lock poisoned");
            if !inner.queued.insert(job.clone()) {
                false
            } else {
                inner.queue.push_back(job);
                true
            }
        };
        if added {
            self.notify.notify_one();
        }
        added
    }

    fn try_pop(&self) -> Option<JobRef> {
        let mut inner = self.inner.lock().expect("job queue lock poisoned");
        let job = inner.queue.pop_front()?;
        inner.queued.remove(&job);
        Some(job)
    }

    /// Wait for the next job, or `None` once cancelled
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<JobRef> {
        loop {
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.inner.lock().expect("job queue lock poisoned").queue.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = JobQueue::new();
        queue.push(JobRef::new("default", "a"));
        queue.push(JobRef::new("default", "b"));
        queue.push(JobRef::new("team", "a"));

        assert_eq!(queue.try_pop().unwrap().name, "a");
        assert_eq!(queue.try_pop().unwrap().name, "b");
        assert_eq!(queue.try_pop().unwrap().namespace, "team");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_dedup_by_identity() {
        let queue = JobQueue::new();
        assert!(queue.push(JobRef::new("default", "a")));
        assert!(!queue.push(JobRef::new("default", "a")));
        assert_eq!(queue.len(), 1);

        // Once drained the same job may queue again.
        queue.try_pop();
        assert!(queue.push(JobRef::new("default", "a")));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };
        tokio::task::yield_now().await;
        queue.push(JobRef::new("default", "late"));

        let popped = waiter.await.unwrap();
        assert_eq!(popped.unwrap().name, "late");
    }

    #[tokio::test]
    async fn test_pop_returns_none_on_cancel() {
        let queue = JobQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.pop(&cancel).await.is_none());
    }
}
