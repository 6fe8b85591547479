//! Synchronization source traits.

use crate::error::SourceError;
use async_trait::async_trait;
use std::time::Duration;

/// Result type alias for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// One key/value pair read from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Full key as the source names it
    pub key: String,
    /// Raw value, exactly as handed to the flag parser
    pub value: String,
    /// Change index at which this value was written
    pub index: u64,
}

/// Result of a full listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Entries in key order
    pub entries: Vec<SourceEntry>,
    /// Cursor to resume watching from
    pub cursor: u64,
}

/// A change delivered by a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or overwritten.
    Put {
        /// Full key
        key: String,
        /// New raw value
        value: String,
        /// Change index of this write
        index: u64,
        /// Value the key held before this write, if the source knows it
        previous: Option<String>,
    },
    /// A key was removed.
    Delete {
        /// Full key
        key: String,
        /// Change index of the removal
        index: u64,
    },
    /// Incremental watching cannot continue; the caller must list again.
    Resync,
}

/// Timing a subscription runs with, handed down by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTiming {
    /// Deadline of one long poll against a remote store
    pub poll_timeout: Duration,
    /// Settle time after a directory swap before resyncing
    pub debounce: Duration,
}

impl Default for WatchTiming {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(60),
            debounce: Duration::from_millis(100),
        }
    }
}

/// Why a source key does not map onto a flag name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRejection {
    /// The key lies outside the source's namespace.
    Foreign,
    /// The key sits below a sub-directory of the namespace.
    Nested,
    /// The key is hidden or reserved for source internals.
    Hidden,
}

/// An open change stream.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next change.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] on transport problems. The subscription
    /// stays usable; callers back off and call again.
    async fn next_event(&mut self) -> SourceResult<WatchEvent>;

    /// Continue after `cursor` once the caller has re-listed following a
    /// [`WatchEvent::Resync`]. Sources whose watch survives a resync ignore it.
    fn resume_from(&mut self, cursor: u64) {
        let _ = cursor;
    }
}

/// A named, ordered collection of string key/value pairs that can be fully
/// listed and incrementally watched.
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> String;

    /// Key prefix or directory this source covers.
    fn namespace(&self) -> &str;

    /// Map a key to a flag name.
    ///
    /// The default treats keys as `<namespace>/<flag>` paths and rejects
    /// anything deeper.
    fn flag_name<'a>(&self, key: &'a str) -> Result<&'a str, KeyRejection> {
        let namespace = self.namespace().trim_end_matches('/');
        let rest = key.strip_prefix(namespace).ok_or(KeyRejection::Foreign)?;
        let rest = rest.strip_prefix('/').ok_or(KeyRejection::Foreign)?;
        if rest.is_empty() {
            return Err(KeyRejection::Foreign);
        }
        if rest.contains('/') {
            return Err(KeyRejection::Nested);
        }
        if rest.starts_with('.') {
            return Err(KeyRejection::Hidden);
        }
        Ok(rest)
    }

    /// Read every entry along with the cursor to watch from.
    async fn list_all(&self) -> SourceResult<Listing>;

    /// Open a change stream starting after `cursor`.
    async fn subscribe(
        &self,
        cursor: u64,
        timing: WatchTiming,
    ) -> SourceResult<Box<dyn Subscription>>;

    /// Whether `restore` can write to this source.
    fn supports_rollback(&self) -> bool {
        false
    }

    /// Write `value` back to `key`, or delete the key when `value` is
    /// `None`, provided nobody changed it since `observed_index`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::CompareFailed`] when another writer got there
    /// first and [`SourceError::RollbackUnsupported`] for read-only sources.
    async fn restore(
        &self,
        key: &str,
        value: Option<&str>,
        observed_index: u64,
    ) -> SourceResult<()> {
        let _ = (key, value, observed_index);
        Err(SourceError::RollbackUnsupported(self.name()))
    }
}
