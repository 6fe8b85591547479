//! Source backed by a revisioned key-value store.

use super::{Listing, SourceResult, Subscription, SyncSource, WatchEvent, WatchTiming};
use crate::error::SourceError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// What happened to a key in a [`KvEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvAction {
    /// Created or overwritten.
    Put,
    /// Deleted or expired.
    Delete,
}

/// One change reported by [`KvStore::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    /// Kind of change
    pub action: KvAction,
    /// Full key
    pub key: String,
    /// New value, absent for deletes
    pub value: Option<String>,
    /// Store index of this change
    pub index: u64,
    /// Value before the change, when the store reports it
    pub previous: Option<String>,
}

/// The four primitives a remote store must offer to back a [`KvSource`].
///
/// Any store with a monotonically increasing change index fits: list a
/// prefix together with the current index, block until the first change
/// after an index, and conditionally write or delete a key only when its
/// last modification index still matches.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> String;

    /// Recursively list every key under `prefix` and return the store index.
    async fn list(&self, prefix: &str) -> SourceResult<Listing>;

    /// Wait up to `timeout` for the first change under `prefix` with index > `after`.
    ///
    /// # Errors
    ///
    /// [`SourceError::Timeout`] when nothing changed in time,
    /// [`SourceError::IndexCleared`] when `after` has been compacted away,
    /// [`SourceError::Unavailable`] for connectivity problems.
    async fn watch(&self, prefix: &str, after: u64, timeout: Duration) -> SourceResult<KvEvent>;

    /// Write `value` only if `key` was last modified at `prev_index`.
    /// Returns the index of the write.
    async fn compare_and_swap(&self, key: &str, value: &str, prev_index: u64) -> SourceResult<u64>;

    /// Delete `key` only if it was last modified at `prev_index`.
    /// Returns the index of the delete.
    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> SourceResult<u64>;
}

/// [`SyncSource`] over a [`KvStore`] prefix.
///
/// Long polls last [`WatchTiming::poll_timeout`], which the watcher takes
/// from its `poll_timeout_ms` setting.
///
/// # Examples
///
/// ```rust
/// use hotswap_flags::sources::{KvSource, MemoryKvStore, SyncSource};
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryKvStore::new());
/// let source = KvSource::new(store, "flags/my-service/");
/// assert_eq!(source.namespace(), "/flags/my-service");
/// ```
pub struct KvSource {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl KvSource {
    /// Create a source for keys directly under `prefix`.
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.starts_with('/') {
            prefix
        } else {
            format!("/{}", prefix)
        };
        Self {
            store,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SyncSource for KvSource {
    fn name(&self) -> String {
        format!("{}:{}", self.store.name(), self.prefix)
    }

    fn namespace(&self) -> &str {
        &self.prefix
    }

    async fn list_all(&self) -> SourceResult<Listing> {
        self.store.list(&self.prefix).await
    }

    async fn subscribe(
        &self,
        cursor: u64,
        timing: WatchTiming,
    ) -> SourceResult<Box<dyn Subscription>> {
        Ok(Box::new(KvSubscription {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            cursor,
            poll_timeout: timing.poll_timeout,
        }))
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn restore(
        &self,
        key: &str,
        value: Option<&str>,
        observed_index: u64,
    ) -> SourceResult<()> {
        match value {
            Some(value) => {
                self.store
                    .compare_and_swap(key, value, observed_index)
                    .await?;
            }
            None => {
                self.store.compare_and_delete(key, observed_index).await?;
            }
        }
        Ok(())
    }
}

/// Long-poll loop anchored at the last seen index.
struct KvSubscription {
    store: Arc<dyn KvStore>,
    prefix: String,
    cursor: u64,
    poll_timeout: Duration,
}

#[async_trait]
impl Subscription for KvSubscription {
    async fn next_event(&mut self) -> SourceResult<WatchEvent> {
        loop {
            match self
                .store
                .watch(&self.prefix, self.cursor, self.poll_timeout)
                .await
            {
                Ok(event) => {
                    self.cursor = self.cursor.max(event.index);
                    return Ok(match event.action {
                        KvAction::Put => WatchEvent::Put {
                            key: event.key,
                            value: event.value.unwrap_or_default(),
                            index: event.index,
                            previous: event.previous,
                        },
                        KvAction::Delete => WatchEvent::Delete {
                            key: event.key,
                            index: event.index,
                        },
                    });
                }
                Err(SourceError::Timeout) => {
                    tracing::trace!(prefix = %self.prefix, cursor = self.cursor, "Watch poll timed out, polling again");
                }
                Err(SourceError::IndexCleared(index)) => {
                    tracing::warn!(prefix = %self.prefix, index, "Watch index cleared, full resync required");
                    return Ok(WatchEvent::Resync);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn resume_from(&mut self, cursor: u64) {
        self.cursor = cursor;
    }
}
