// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded execution pool for paid jobs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::warn;

/// Supervised worker pool with bounded concurrency and an unbounded queue.
///
/// Submissions are accepted immediately; each task waits for a semaphore
/// permit before doing work, so at most `max_concurrency` jobs hit the
/// inference backend at once. Every task keeps a join handle, which is
/// what lets shutdown wait for in-flight work instead of abandoning it
/// fire-and-forget style.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    /// Create a pool running at most `max_concurrency` jobs at once.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Submit a job. Returns immediately; the job runs once a permit
    /// frees up.
    pub async fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let mut tasks = self.tasks.lock().await;

        // Reap already-finished tasks so the set does not grow unbounded.
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                warn!(target: "dvm.runtime", error = %e, "execution task panicked");
            }
        }

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            fut.await;
        });
    }

    /// Number of tasks currently queued or running.
    pub async fn in_flight(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait up to `grace` for in-flight tasks, then abandon the rest.
    ///
    /// Abandoned jobs keep their Processing row and are reconciled at the
    /// next start.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = self.tasks.lock().await;
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            if tasks.is_empty() {
                return;
            }
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Err(e))) => {
                    warn!(target: "dvm.runtime", error = %e, "execution task panicked");
                }
                Ok(Some(Ok(()))) => {}
                Ok(None) => return,
                Err(_) => {
                    warn!(
                        target: "dvm.runtime",
                        abandoned = tasks.len(),
                        "grace period elapsed, abandoning tasks"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return;
                }
            }
        }
    }
}
