// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shutdown signalling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cloneable one-shot shutdown signal.
///
/// All clones share the same state; triggering any clone wakes every task
/// parked on [`triggered`](Self::triggered).
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    fired: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// A token that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown. Idempotent.
    pub fn trigger(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether shutdown has been signalled.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Completes when shutdown is signalled; immediately if it already was.
    pub async fn triggered(&self) {
        if self.is_triggered() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_triggered() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("fired", &self.is_triggered())
            .finish()
    }
}
