//! Tracking of requests awaiting a response from a remote endpoint.
//!
//! Entries are keyed by `(endpoint, message id)` so several waits on the
//! same endpoint can be in flight at once. Every entry is armed with its own
//! timer task, so it is removed and failed with [`WireError::Timeout`] even
//! if nobody ever polls the returned future.

use crate::error::{WireError, WireResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use peermesh_types::{EndpointId, MessageId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

/// Correlation key of one pending request.
pub type PendingKey = (EndpointId, MessageId);

struct Entry<T, C> {
    tx: oneshot::Sender<WireResult<T>>,
    context: C,
    generation: u64,
    timer: AbortHandle,
}

type Entries<T, C> = Mutex<HashMap<PendingKey, Entry<T, C>>>;

/// A claimed pending entry. Completing it resolves the waiting future.
pub struct Completion<T, C = ()> {
    tx: oneshot::Sender<WireResult<T>>,
    /// Whatever the caller attached when registering.
    pub context: C,
}

impl<T, C> Completion<T, C> {
    /// Resolve the waiter. Returns `false` if the waiter is gone.
    pub fn complete(self, result: WireResult<T>) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Table of in-flight requests.
pub struct PendingTable<T, C = ()> {
    entries: Arc<Entries<T, C>>,
    generation: AtomicU64,
}

impl<T, C> PendingTable<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Register a pending request and return the future that resolves with
    /// its outcome.
    ///
    /// The entry exists as soon as this returns, so a response that arrives
    /// before the future is first polled is not lost. Registering a key that
    /// is already pending cancels the older wait.
    pub fn register(
        &self,
        key: PendingKey,
        context: C,
        timeout: Duration,
    ) -> BoxFuture<'static, WireResult<T>> {
        let (tx, rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let weak: Weak<Entries<T, C>> = Arc::downgrade(&self.entries);
        let timer_key = key.clone();

        // The timer is spawned while the map is locked so it cannot observe
        // the table before the entry it guards is inserted.
        let replaced = {
            let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(entries) = weak.upgrade() else {
                    return;
                };
                let expired = {
                    let mut map = entries.lock().unwrap_or_else(|e| e.into_inner());
                    match map.get(&timer_key) {
                        Some(entry) if entry.generation == generation => map.remove(&timer_key),
                        _ => None,
                    }
                };
                if let Some(entry) = expired {
                    debug!(
                        endpoint = %timer_key.0,
                        message = %timer_key.1,
                        "Pending request timed out"
                    );
                    let _ = entry.tx.send(Err(WireError::Timeout(timeout)));
                }
            })
            .abort_handle();
            map.insert(
                key,
                Entry {
                    tx,
                    context,
                    generation,
                    timer,
                },
            )
        };
        if let Some(old) = replaced {
            old.timer.abort();
            let _ = old.tx.send(Err(WireError::Cancelled));
        }

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(WireError::Cancelled),
            }
        }
        .boxed()
    }

    /// Claim the entry for `key`, disarming its timer.
    pub fn take(&self, key: &PendingKey) -> Option<Completion<T, C>> {
        let entry = {
            let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(key)
        }?;
        entry.timer.abort();
        Some(Completion {
            tx: entry.tx,
            context: entry.context,
        })
    }

    /// Resolve the entry for `key` with a value. Returns `false` when no
    /// such entry is pending.
    pub fn complete(&self, key: &PendingKey, value: T) -> bool {
        match self.take(key) {
            Some(completion) => completion.complete(Ok(value)),
            None => false,
        }
    }

    /// Fail the wait for `key` with [`WireError::Cancelled`].
    pub fn cancel(&self, key: &PendingKey) -> bool {
        match self.take(key) {
            Some(completion) => {
                completion.complete(Err(WireError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Whether a request is pending for `key`.
    pub fn contains(&self, key: &PendingKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Fail every wait on `endpoint` with [`WireError::Cancelled`].
    pub fn cancel_endpoint(&self, endpoint: &EndpointId) -> usize {
        let removed: Vec<Entry<T, C>> = {
            let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<PendingKey> = map
                .keys()
                .filter(|(id, _)| id == endpoint)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| map.remove(k)).collect()
        };
        let count = removed.len();
        for entry in removed {
            entry.timer.abort();
            let _ = entry.tx.send(Err(WireError::Cancelled));
        }
        count
    }

    /// Fail every pending wait with [`WireError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let removed: Vec<Entry<T, C>> = {
            let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, entry)| entry).collect()
        };
        let count = removed.len();
        for entry in removed {
            entry.timer.abort();
            let _ = entry.tx.send(Err(WireError::Cancelled));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, C> Default for PendingTable<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(machine: &str) -> PendingKey {
        (EndpointId::new(machine, 1), MessageId::new())
    }

    #[tokio::test]
    async fn test_complete_before_poll() {
        let table = PendingTable::<String>::new();
        let k = key("a");
        let wait = table.register(k.clone(), (), Duration::from_secs(5));
        assert!(table.complete(&k, "pong".to_string()));
        assert_eq!(wait.await.unwrap(), "pong");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_completed() {
        let table = PendingTable::<u32>::new();
        assert!(!table.complete(&key("a"), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_without_polling() {
        let table = PendingTable::<u32>::new();
        let k = key("a");
        let wait = table.register(k.clone(), (), Duration::from_millis(100));
        assert!(table.contains(&k));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!table.contains(&k));
        assert!(matches!(wait.await, Err(WireError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancel_endpoint_only_touches_that_endpoint() {
        let table = PendingTable::<u32>::new();
        let a1 = key("a");
        let a2 = (a1.0.clone(), MessageId::new());
        let b = key("b");
        let wait_a1 = table.register(a1, (), Duration::from_secs(5));
        let wait_a2 = table.register(a2, (), Duration::from_secs(5));
        let _wait_b = table.register(b.clone(), (), Duration::from_secs(5));

        assert_eq!(table.cancel_endpoint(&EndpointId::new("a", 1)), 2);
        assert!(matches!(wait_a1.await, Err(WireError::Cancelled)));
        assert!(matches!(wait_a2.await, Err(WireError::Cancelled)));
        assert!(table.contains(&b));
    }

    #[tokio::test]
    async fn test_reregister_cancels_previous() {
        let table = PendingTable::<u32>::new();
        let k = key("a");
        let first = table.register(k.clone(), (), Duration::from_secs(5));
        let second = table.register(k.clone(), (), Duration::from_secs(5));
        assert!(matches!(first.await, Err(WireError::Cancelled)));
        table.complete(&k, 7);
        assert_eq!(second.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_take_returns_context() {
        let table = PendingTable::<u32, &'static str>::new();
        let k = key("a");
        let wait = table.register(k.clone(), "payload.bin", Duration::from_secs(5));
        let completion = table.take(&k).unwrap();
        assert_eq!(completion.context, "payload.bin");
        completion.complete(Ok(3));
        assert_eq!(wait.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let table = PendingTable::<u32>::new();
        let wait = table.register(key("a"), (), Duration::from_secs(5));
        let _other = table.register(key("b"), (), Duration::from_secs(5));
        assert_eq!(table.cancel_all(), 2);
        assert!(table.is_empty());
        assert!(matches!(wait.await, Err(WireError::Cancelled)));
    }
}
