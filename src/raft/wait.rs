//! Wait registry correlating proposal IDs with blocked callers.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::store::Callback;

struct Waiter {
    tx: oneshot::Sender<Result<()>>,
    callback: Option<Callback>,
}

/// Maps request IDs to single-shot delivery slots. A slot is triggered or
/// cancelled at most once; a cancelled receiver observes a closed channel
/// rather than a value.
#[derive(Default)]
pub struct WaitRegistry {
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `id`. The callback, if any, runs under the
    /// applier immediately after a successful trigger and before the
    /// outcome is delivered.
    pub fn register(&self, id: u64, callback: Option<Callback>) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(id, Waiter { tx, callback });
        rx
    }

    /// Delivers `outcome` to the slot for `id`. Returns true iff a
    /// registration existed.
    pub fn trigger(&self, id: u64, outcome: Result<()>) -> bool {
        let waiter = self.waiters.lock().unwrap().remove(&id);
        match waiter {
            Some(waiter) => {
                if outcome.is_ok() {
                    if let Some(callback) = waiter.callback {
                        callback();
                    }
                }
                let _ = waiter.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Closes the slot for `id` without delivering a value.
    pub fn cancel(&self, id: u64) {
        self.waiters.lock().unwrap().remove(&id);
    }

    /// Cancels every outstanding registration. Used on leader loss.
    pub fn cancel_all(&self) {
        self.waiters.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

/// Maps a slot receive result back to the proposal outcome: a closed
/// channel means the registration was cancelled.
pub async fn outcome(rx: oneshot::Receiver<Result<()>>) -> Result<()> {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::LostLeadership),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn trigger_delivers_value_once() {
        let registry = WaitRegistry::new();
        let rx = registry.register(7, None);

        assert!(registry.trigger(7, Ok(())));
        assert!(!registry.trigger(7, Ok(())));
        assert!(outcome(rx).await.is_ok());
    }

    #[tokio::test]
    async fn callback_runs_only_on_success() {
        let registry = WaitRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let rx = registry.register(1, Some(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        })));
        registry.trigger(1, Ok(()));
        assert!(outcome(rx).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counted = calls.clone();
        let rx = registry.register(2, Some(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        })));
        registry.trigger(2, Err(Error::IdExists));
        assert!(outcome(rx).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_closes_without_value() {
        let registry = WaitRegistry::new();
        let rx = registry.register(3, None);
        registry.cancel(3);
        assert!(matches!(outcome(rx).await, Err(Error::LostLeadership)));
    }

    #[tokio::test]
    async fn cancel_all_clears_every_waiter() {
        let registry = WaitRegistry::new();
        let rx_a = registry.register(1, None);
        let rx_b = registry.register(2, None);
        assert_eq!(registry.outstanding(), 2);

        registry.cancel_all();
        assert_eq!(registry.outstanding(), 0);
        assert!(matches!(outcome(rx_a).await, Err(Error::LostLeadership)));
        assert!(matches!(outcome(rx_b).await, Err(Error::LostLeadership)));
    }

    #[tokio::test]
    async fn trigger_unknown_id_reports_missing() {
        let registry = WaitRegistry::new();
        assert!(!registry.trigger(99, Ok(())));
    }
}
