// SPDX-License-Identifier: MIT OR Apache-2.0
//! Orchestration layer for the DVM agent.
//!
//! Responsibilities:
//! - drive each job through its lifecycle state machine
//! - bound concurrent executions with a supervised worker pool
//! - expire unpaid jobs on a fixed cadence
//! - reconcile interrupted work after a restart

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod orchestrator;
mod pool;
mod shutdown;
mod sweeper;

pub use orchestrator::{Orchestrator, RuntimeError};
pub use pool::WorkerPool;
pub use shutdown::ShutdownToken;
pub use sweeper::run_sweeper;

use std::sync::Arc;

use tracing::info;

use dvm_core::JobState;
use dvm_store::{JobPatch, JobStore, StoreError};

/// Restart reconciliation: any job left in Processing by a previous run
/// is failed with a stable marker, since its execution task is gone.
/// Returns the number of jobs reconciled.
pub fn reconcile_interrupted(store: &Arc<JobStore>) -> Result<usize, StoreError> {
    let mut count = 0;
    for job in store.jobs_in_state(JobState::Processing)? {
        let moved = store.transition(
            &job.event_id,
            JobState::Processing,
            JobState::Failed,
            JobPatch::error("interrupted".into()),
        )?;
        if moved {
            info!(
                target: "dvm.runtime",
                event_id = %job.event_id,
                "interrupted job failed on restart"
            );
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvm_core::JobInput;

    fn input(kind: u16) -> JobInput {
        JobInput {
            event_id: "evt".into(),
            customer: "pk".into(),
            kind,
            content: "text".into(),
            ..Default::default()
        }
    }

    #[test]
    fn reconcile_fails_processing_jobs_only() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        store.create("stuck", "pk", 5001, &input(5001)).unwrap();
        store
            .update("stuck", JobState::Processing, JobPatch::default())
            .unwrap();
        store.create("waiting", "pk", 5001, &input(5001)).unwrap();
        store
            .update("waiting", JobState::WaitingPayment, JobPatch::default())
            .unwrap();

        let count = reconcile_interrupted(&store).unwrap();
        assert_eq!(count, 1);

        let stuck = store.get("stuck").unwrap().unwrap();
        assert_eq!(stuck.state, JobState::Failed);
        assert_eq!(stuck.error.as_deref(), Some("interrupted"));

        let waiting = store.get("waiting").unwrap().unwrap();
        assert_eq!(waiting.state, JobState::WaitingPayment);
    }

    #[test]
    fn reconcile_with_clean_store_is_a_noop() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        assert_eq!(reconcile_interrupted(&store).unwrap(), 0);
    }
}
