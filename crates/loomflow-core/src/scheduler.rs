//! Bounded-parallelism batch scheduler.
//!
//! Runs one batch of independent step tasks at a time: every task is
//! spawned onto a `JoinSet`, with a `Semaphore` capping how many execute
//! concurrently. Task failures are values, not panics -- one step's failure
//! never tears down its batch siblings.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default cap on steps executing concurrently within a batch.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Semaphore-bounded batch runner.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    semaphore: Arc<Semaphore>,
}

impl BatchScheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Run a batch of keyed tasks, at most `concurrency` at a time, and
    /// collect their results keyed by task ID.
    ///
    /// A task that panics is simply absent from the result map; the caller
    /// treats a missing entry as a failed step.
    pub async fn run_batch<T, F>(&self, tasks: Vec<(String, F)>) -> HashMap<String, T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = T> + Send + 'static,
    {
        let mut join_set = JoinSet::new();
        for (id, task) in tasks {
            let semaphore = Arc::clone(&self.semaphore);
            join_set.spawn(async move {
                // The semaphore is never closed while the scheduler is alive,
                // so acquisition only fails if the runtime is shutting down.
                let _permit = semaphore.acquire_owned().await.ok();
                (id, task.await)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, value)) => {
                    results.insert(id, value);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "step task aborted");
                }
            }
        }
        results
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
