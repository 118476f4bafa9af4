//! Bounded worker pool for off-thread handler work.
//!
//! Off-thread handler executions and scheduled ticks run here so a slow
//! external call cannot stall the primary dispatch context. The bound is a
//! semaphore: tasks are spawned immediately but wait for a permit before
//! running, so at most `capacity` handler bodies execute at once.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Semaphore-bounded executor for handler work.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool that runs at most `capacity` jobs concurrently.
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Submit a job. Returns immediately; the job waits for a permit
    /// inside its own task.
    pub fn spawn<F>(&self, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            // The semaphore is never closed; an Err here means the pool
            // itself is gone, in which case the job is dropped.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        })
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
