//! Completion barrier over in-flight send and reply calls.
//!
//! Close waits for the barrier to reach zero before shutting the transport
//! down, so no caller is left mid-call on a dead connection. Only
//! registered callers are counted; handler tasks are never joined.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counter of active calls with an awaitable idle state.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    active: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn new() -> Self { Self::default() }

    /// Enter the barrier; the returned guard leaves it on drop.
    pub(crate) fn enter(&self) -> InFlightGuard<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { barrier: self }
    }

    /// Wait until no calls are active.
    pub(crate) async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Active-call token; leaving the barrier happens on drop.
pub(crate) struct InFlightGuard<'a> {
    barrier: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.barrier.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.barrier.idle.notify_waiters();
        }
    }
}
