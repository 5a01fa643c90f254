//! Bounded background executor for post-response accounting. Submission
//! never rejects and never blocks the request path: the permit wait happens
//! inside the spawned worker. The bound keeps traffic spikes from spawning
//! unbounded tasks; the drain keeps shutdown from dropping settlement work.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

pub const DEFAULT_TASK_LIMIT: usize = 10_000;

#[derive(Clone, Debug)]
pub struct BoundedRunner {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl BoundedRunner {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Submits `task` for background execution. Returns immediately; at most
    /// `limit` tasks run concurrently, the rest queue on the semaphore
    /// inside their worker.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        self.tracker.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            task.await;
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits up to `deadline` for in-flight tasks to finish. Returns the
    /// number of tasks still pending when the deadline expired.
    pub async fn drain(&self, deadline: Duration) -> usize {
        self.tracker.close();
        match tokio::time::timeout(deadline, self.tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => self.tracker.len(),
        }
    }
}

impl Default for BoundedRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_LIMIT)
    }
}
