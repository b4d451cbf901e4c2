use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// Releases whatever an evicted value holds. Must not fail.
#[async_trait]
pub trait Teardown: Send + Sync + 'static {
    async fn teardown(&self);
}

struct Entry<C> {
    cell: OnceCell<Arc<C>>,
    last_access: Mutex<Instant>,
}

impl<C> Entry<C> {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_access.lock())
    }
}

pub struct SessionCache<C> {
    entries: Mutex<HashMap<String, Arc<Entry<C>>>>,
    ttl: Duration,
}

impl<C: Teardown> SessionCache<C> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    // Returns the cached value for `key`, building it with `create` if absent.
    // A failed build leaves nothing behind, so the next call tries again.
    pub async fn get_or_create<F, Fut, E>(&self, key: &str, create: F) -> Result<Arc<C>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let entry = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Entry::new()));
            // under the map lock, so a concurrent sweep cannot see the stale clock
            entry.touch();
            entry.clone()
        };

        let res = entry
            .cell
            .get_or_try_init(|| async { create().await.map(Arc::new) })
            .await
            .cloned();

        if res.is_err() {
            let mut entries = self.entries.lock();
            if let Some(current) = entries.get(key) {
                if Arc::ptr_eq(current, &entry) && current.cell.get().is_none() {
                    entries.remove(key);
                }
            }
        }
        entry.touch();
        res
    }

    // Drops the entry without tearing it down.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|e| e.cell.get().is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn clear(&self) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (key, entry) in drained {
            if let Some(value) = entry.cell.get() {
                tracing::debug!(key = %key, "tearing down cached connection");
                value.teardown().await;
            }
        }
    }

    fn take_expired(&self, now: Instant) -> Vec<(String, Arc<C>)> {
        let mut entries = self.entries.lock();
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.cell.get().is_some() && e.idle_for(now) >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| {
                let entry = entries.remove(&key)?;
                let value = entry.cell.get()?.clone();
                Some((key, value))
            })
            .collect()
    }
}

// Starts the sweeper and the teardown worker. Both stop when `cache` is dropped.
pub fn spawn_eviction<C: Teardown>(
    cache: &Arc<SessionCache<C>>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    let (due_tx, mut due_rx) = mpsc::unbounded_channel::<(String, Arc<C>)>();

    tokio::spawn(async move {
        while let Some((key, value)) = due_rx.recv().await {
            tracing::info!(key = %key, "evicting idle connection");
            let res = tokio::spawn(async move { value.teardown().await }).await;
            if let Err(err) = res {
                tracing::error!(key = %key, error = %err, "teardown of evicted connection failed");
            }
        }
    });

    let weak = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let Some(cache) = weak.upgrade() else {
                return;
            };
            for due in cache.take_expired(Instant::now()) {
                if due_tx.send(due).is_err() {
                    return;
                }
            }
        }
    })
}
