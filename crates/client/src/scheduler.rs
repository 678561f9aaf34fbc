//! Delayed reconnect tasks, at most one per connection name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::state::ReconnectReason;

/// Fixed post-failure delays, keyed by what went wrong.
///
/// There is no exponential backoff here: the protocol's recovery policy is
/// a flat delay per failure class.  Defaults are overridable, mainly so
/// tests can run with short timers.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Transport closed with a code outside the normal/going-away set.
    pub abnormal_close_delay: Duration,
    /// Transport-level error event.
    pub transport_error_delay: Duration,
    /// Transport construction failed outright.
    pub connect_failure_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            abnormal_close_delay: Duration::from_millis(2000),
            transport_error_delay: Duration::from_millis(3000),
            connect_failure_delay: Duration::from_millis(5000),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, reason: ReconnectReason) -> Duration {
        match reason {
            ReconnectReason::AbnormalClose => self.abnormal_close_delay,
            ReconnectReason::TransportError => self.transport_error_delay,
            ReconnectReason::ConnectFailure => self.connect_failure_delay,
        }
    }
}

/// Holds zero or one outstanding delayed task per connection name.
///
/// [`schedule`](Self::schedule) cancels any existing task for the name
/// before registering the new one, so no matter how many failure events
/// arrive in quick succession, at most one reconnect attempt is ever in
/// flight per connection.  Cheap to clone; all clones share one task map.
#[derive(Clone, Default)]
pub struct ReconnectScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    pending: Mutex<HashMap<String, PendingReconnect>>,
    next_seq: AtomicU64,
}

struct PendingReconnect {
    /// Identifies the task that owns this entry.  A fired task may only
    /// remove the entry carrying its own seq; a stale fire racing a
    /// replacement must not evict the replacement.
    seq: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PendingReconnect {
    fn abort(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

impl SchedulerInner {
    /// Remove the entry for `name` only if it still belongs to the fired
    /// task identified by `seq`.
    fn clear_fired(&self, name: &str, seq: u64) {
        let mut pending = self.pending.lock();
        if pending.get(name).is_some_and(|task| task.seq == seq) {
            pending.remove(name);
        }
    }
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, replacing any pending task for `name`.
    pub fn schedule<F>(&self, name: &str, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_name = name.to_string();
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    inner.clear_fired(&task_name, seq);
                    action.await;
                }
                _ = task_cancel.cancelled() => {}
            }
        });

        let previous = self
            .inner
            .pending
            .lock()
            .insert(name.to_string(), PendingReconnect { seq, cancel, handle });
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancel the pending task for `name`, if any.  Idempotent.
    pub fn cancel(&self, name: &str) {
        if let Some(task) = self.inner.pending.lock().remove(name) {
            task.abort();
        }
    }

    /// Cancel every pending task.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingReconnect> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().map(|(_, task)| task).collect()
        };
        for task in drained {
            task.abort();
        }
    }

    pub fn has_pending(&self, name: &str) -> bool {
        self.inner.pending.lock().contains_key(name)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
