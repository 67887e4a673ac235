//! Cancellable delayed callbacks
//!
//! A timer either fires once or is cancelled. Cancelling only prevents a
//! pending fire: once the delay has elapsed the callback runs to completion,
//! so a late `cancel()` can never interrupt a phase resolution halfway.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct Clock;

impl Clock {
    pub fn new() -> Self {
        Self
    }

    /// Run `callback` after `delay` unless the returned handle is cancelled first
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = Arc::new(Notify::new());
        let fired = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));

        let task_cancel = cancel.clone();
        let task_fired = fired.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = task_cancel.notified() => return,
            }
            task_fired.store(true, Ordering::SeqCst);
            callback.await;
        });

        TimerHandle {
            cancel,
            fired,
            cancelled,
        }
    }
}

#[derive(Debug)]
pub struct TimerHandle {
    cancel: Arc<Notify>,
    fired: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Cancel a pending timer. Safe to call any number of times, before or
    /// after the timer fired. Returns true only for the call that actually
    /// prevented the callback from running.
    pub fn cancel(&self) -> bool {
        if self.fired.load(Ordering::SeqCst) {
            return false;
        }
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        // notify_one stores a permit, so this works even if the task has not
        // been polled yet
        self.cancel.notify_one();
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
