// SPDX-License-Identifier: MIT OR Apache-2.0
//! Expiry sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use dvm_store::JobStore;

use crate::shutdown::ShutdownToken;

/// Periodically expire jobs stuck in WaitingPayment.
///
/// Fixed cadence; every tick runs one atomic `expire_stale` update. The
/// sweeper never publishes anything — customers who cared have stopped
/// waiting, and silent expiry keeps the protocol surface minimal.
pub async fn run_sweeper(
    store: Arc<JobStore>,
    interval_secs: u64,
    payment_timeout_secs: u64,
    shutdown: ShutdownToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        target: "dvm.runtime",
        interval_secs,
        payment_timeout_secs,
        "sweeper started"
    );

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = ticker.tick() => {
                match store.expire_stale(payment_timeout_secs) {
                    Ok(0) => {}
                    Ok(count) => info!(target: "dvm.runtime", count, "expired stale jobs"),
                    Err(e) => warn!(target: "dvm.runtime", error = %e, "expiry sweep failed"),
                }
            }
        }
    }
    info!(target: "dvm.runtime", "sweeper stopped");
}
