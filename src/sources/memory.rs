//! In-process revisioned key-value store.

use super::{KvAction, KvEvent, KvStore, Listing, SourceEntry, SourceResult};
use crate::error::SourceError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_HISTORY_LIMIT: usize = 1000;

struct Inner {
    /// key -> (value, modified index)
    data: BTreeMap<String, (String, u64)>,
    history: VecDeque<KvEvent>,
    history_limit: usize,
    /// Highest index no longer present in `history`
    compacted_through: u64,
    index: u64,
    available: bool,
}

impl Inner {
    fn record(&mut self, event: KvEvent) {
        self.history.push_back(event);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted_through = dropped.index;
            }
        }
    }

    fn first_after(&self, prefix: &str, after: u64) -> SourceResult<Option<KvEvent>> {
        if after < self.compacted_through {
            return Err(SourceError::IndexCleared(after));
        }
        Ok(self
            .history
            .iter()
            .find(|e| e.index > after && in_prefix(prefix, &e.key))
            .cloned())
    }

    fn check_available(&self) -> SourceResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(SourceError::Unavailable("store marked unavailable".to_string()))
        }
    }
}

fn in_prefix(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    key.strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// A [`KvStore`] kept in memory.
///
/// Every write bumps a global index, and a bounded event history backs
/// `watch`. Once history is trimmed, watching from an older index fails with
/// [`SourceError::IndexCleared`] just like a compacted remote store. The
/// store can also be flagged unavailable to exercise retry paths.
///
/// # Examples
///
/// ```rust
/// use hotswap_flags::sources::MemoryKvStore;
///
/// let store = MemoryKvStore::new();
/// let index = store.put("/flags/svc/count", "10");
/// assert_eq!(store.get("/flags/svc/count").as_deref(), Some("10"));
/// assert_eq!(store.index(), index);
/// ```
pub struct MemoryKvStore {
    inner: Mutex<Inner>,
    index_tx: watch::Sender<u64>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                history: VecDeque::new(),
                history_limit: DEFAULT_HISTORY_LIMIT,
                compacted_through: 0,
                index: 0,
                available: true,
            }),
            index_tx,
        }
    }

    /// Keep at most `limit` events for watchers.
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.inner.lock().history_limit = limit.max(1);
        self
    }

    /// Current store index.
    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }

    /// Read a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().data.get(key).map(|(v, _)| v.clone())
    }

    /// Unconditionally write a key and return the new index.
    pub fn put(&self, key: &str, value: &str) -> u64 {
        let index = {
            let mut inner = self.inner.lock();
            inner.index += 1;
            let index = inner.index;
            let previous = inner
                .data
                .insert(key.to_string(), (value.to_string(), index))
                .map(|(v, _)| v);
            inner.record(KvEvent {
                action: KvAction::Put,
                key: key.to_string(),
                value: Some(value.to_string()),
                index,
                previous,
            });
            index
        };
        self.index_tx.send_replace(index);
        index
    }

    /// Unconditionally delete a key, returning the new index if it existed.
    pub fn delete(&self, key: &str) -> Option<u64> {
        let index = {
            let mut inner = self.inner.lock();
            let (previous, _) = inner.data.remove(key)?;
            inner.index += 1;
            let index = inner.index;
            inner.record(KvEvent {
                action: KvAction::Delete,
                key: key.to_string(),
                value: None,
                index,
                previous: Some(previous),
            });
            index
        };
        self.index_tx.send_replace(index);
        Some(index)
    }

    /// Drop all retained history, as a store compaction would.
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        inner.history.clear();
        inner.compacted_through = inner.index;
    }

    /// Simulate the store going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
        // Wake pollers so they observe the change.
        self.index_tx.send_modify(|_| {});
    }

    fn modified_index(inner: &Inner, key: &str) -> SourceResult<u64> {
        inner
            .data
            .get(key)
            .map(|(_, index)| *index)
            .ok_or_else(|| SourceError::KeyNotFound(key.to_string()))
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> String {
        "memory".to_string()
    }

    async fn list(&self, prefix: &str) -> SourceResult<Listing> {
        let inner = self.inner.lock();
        inner.check_available()?;
        let entries = inner
            .data
            .iter()
            .filter(|(key, _)| in_prefix(prefix, key))
            .map(|(key, (value, index))| SourceEntry {
                key: key.clone(),
                value: value.clone(),
                index: *index,
            })
            .collect();
        Ok(Listing {
            entries,
            cursor: inner.index,
        })
    }

    async fn watch(&self, prefix: &str, after: u64, timeout: Duration) -> SourceResult<KvEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        // Subscribe before inspecting history so a concurrent write still wakes us.
        let mut rx = self.index_tx.subscribe();
        loop {
            {
                let inner = self.inner.lock();
                inner.check_available()?;
                if let Some(event) = inner.first_after(prefix, after)? {
                    return Ok(event);
                }
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SourceError::Closed),
                Err(_) => return Err(SourceError::Timeout),
            }
        }
    }

    async fn compare_and_swap(&self, key: &str, value: &str, prev_index: u64) -> SourceResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        if Self::modified_index(&inner, key)? != prev_index {
            return Err(SourceError::CompareFailed(key.to_string()));
        }
        inner.index += 1;
        let index = inner.index;
        let previous = inner
            .data
            .insert(key.to_string(), (value.to_string(), index))
            .map(|(v, _)| v);
        inner.record(KvEvent {
            action: KvAction::Put,
            key: key.to_string(),
            value: Some(value.to_string()),
            index,
            previous,
        });
        drop(inner);
        self.index_tx.send_replace(index);
        Ok(index)
    }

    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> SourceResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        if Self::modified_index(&inner, key)? != prev_index {
            return Err(SourceError::CompareFailed(key.to_string()));
        }
        let previous = inner.data.remove(key).map(|(v, _)| v);
        inner.index += 1;
        let index = inner.index;
        inner.record(KvEvent {
            action: KvAction::Delete,
            key: key.to_string(),
            value: None,
            index,
            previous,
        });
        drop(inner);
        self.index_tx.send_replace(index);
        Ok(index)
    }
}
