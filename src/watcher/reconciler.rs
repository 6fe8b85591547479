//! Keeps a flag registry in step with a synchronization source.

use super::WatcherConfig;
use super::backoff::Backoff;
use crate::core::FlagSet;
use crate::error::{FlagError, InitializeErrors, Result, SourceError};
use crate::sources::{KeyRejection, Subscription, SyncSource, WatchEvent, WatchTiming};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`Reconciler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Created, nothing read yet.
    Uninitialized,
    /// The initial listing is in flight.
    Initializing,
    /// The initial listing was applied.
    Initialized,
    /// The background loop is running.
    Watching,
    /// The loop was stopped; the watcher cannot be restarted.
    Stopped,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Applies source values to a registry, first once and then continuously.
///
/// `initialize` performs a blocking first pass that may set any flag.
/// `start` spawns a single background task that applies later changes to
/// dynamic flags only. A write the flag rejects is rolled back, when the
/// source allows it, to the value the flag is running with, or deleted if
/// the flag still holds its default. `stop` cancels that task and waits for
/// it, so no flag changes once it returns.
///
/// Subscriptions are opened with [`WatcherConfig::watch_timing`].
///
/// # Examples
///
/// ```rust
/// use hotswap_flags::core::FlagRegistry;
/// use hotswap_flags::sources::{KvSource, MemoryKvStore};
/// use hotswap_flags::watcher::Reconciler;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> hotswap_flags::Result<()> {
/// let registry = Arc::new(FlagRegistry::new());
/// let limit = registry.dynamic("rate_limit", 100u32, "Requests per second")?;
///
/// let store = Arc::new(MemoryKvStore::new());
/// store.put("/flags/api/rate_limit", "250");
///
/// let watcher = Reconciler::new(registry, Arc::new(KvSource::new(store, "/flags/api")));
/// watcher.initialize().await?;
/// assert_eq!(*limit.get(), 250);
///
/// watcher.start()?;
/// watcher.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Reconciler {
    registry: Arc<dyn FlagSet>,
    source: Arc<dyn SyncSource>,
    config: WatcherConfig,
    state: Mutex<WatcherState>,
    cursor: Arc<AtomicU64>,
    task: Mutex<Option<Running>>,
}

impl Reconciler {
    /// Create a watcher with default settings.
    pub fn new(registry: Arc<dyn FlagSet>, source: Arc<dyn SyncSource>) -> Self {
        Self::with_config(registry, source, WatcherConfig::default())
    }

    /// Create a watcher with explicit settings.
    pub fn with_config(
        registry: Arc<dyn FlagSet>,
        source: Arc<dyn SyncSource>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            registry,
            source,
            config,
            state: Mutex::new(WatcherState::Uninitialized),
            cursor: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    /// Last change index applied or skipped.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Read every entry from the source and apply it to the matching flag.
    ///
    /// Static flags are set here too; this is the only pass that may touch
    /// them. Keys that apply cleanly stay applied even when others fail.
    ///
    /// # Errors
    ///
    /// - [`FlagError::AlreadyInitialized`] on a second call
    /// - [`FlagError::Source`] if the listing fails; the watcher may be initialized again
    /// - [`FlagError::Initialize`] naming every key that was unknown or rejected;
    ///   the watcher still counts as initialized
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Uninitialized {
                return Err(FlagError::AlreadyInitialized);
            }
            *state = WatcherState::Initializing;
        }

        let listing = match self.source.list_all().await {
            Ok(listing) => listing,
            Err(e) => {
                *self.state.lock() = WatcherState::Uninitialized;
                tracing::error!(source = %self.source.name(), error = %e, "Initial listing failed");
                return Err(e.into());
            }
        };

        let mut errors = InitializeErrors::default();
        let mut applied = 0usize;
        for entry in &listing.entries {
            let name = match self.source.flag_name(&entry.key) {
                Ok(name) => name,
                Err(KeyRejection::Nested) => {
                    tracing::warn!(key = %entry.key, "Ignoring nested key");
                    continue;
                }
                Err(rejection) => {
                    tracing::debug!(key = %entry.key, ?rejection, "Ignoring key");
                    continue;
                }
            };

            if self.registry.lookup(name).is_none() {
                errors.push(&entry.key, FlagError::UnknownFlag(name.to_string()));
                continue;
            }

            match self.registry.set_by_name(name, &entry.value) {
                Ok(()) => applied += 1,
                Err(e) => errors.push(&entry.key, e),
            }
        }

        self.cursor.fetch_max(listing.cursor, Ordering::AcqRel);
        *self.state.lock() = WatcherState::Initialized;

        tracing::info!(
            source = %self.source.name(),
            applied,
            failed = errors.len(),
            cursor = listing.cursor,
            "Initial sync complete"
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlagError::Initialize(errors))
        }
    }

    /// Spawn the background loop on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`FlagError::NotInitialized`] before `initialize` completed
    /// - [`FlagError::AlreadyWatching`] if the loop is running
    /// - [`FlagError::Stopped`] after `stop`
    /// - [`FlagError::NoRuntime`] outside a tokio runtime
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            WatcherState::Initialized => {}
            WatcherState::Uninitialized | WatcherState::Initializing => {
                return Err(FlagError::NotInitialized);
            }
            WatcherState::Watching => return Err(FlagError::AlreadyWatching),
            WatcherState::Stopped => return Err(FlagError::Stopped),
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| FlagError::NoRuntime)?;

        let token = CancellationToken::new();
        let worker = Worker {
            registry: Arc::clone(&self.registry),
            source: Arc::clone(&self.source),
            cursor: Arc::clone(&self.cursor),
            backoff: Backoff::new(self.config.backoff),
            timing: self.config.watch_timing(),
            token: token.clone(),
        };
        let handle = runtime.spawn(worker.run());

        *self.task.lock() = Some(Running { token, handle });
        *state = WatcherState::Watching;

        tracing::info!(source = %self.source.name(), cursor = self.cursor(), "Watcher started");
        Ok(())
    }

    /// Cancel the loop and wait for it to finish.
    ///
    /// The loop gets `stop_grace` to wind down before it is aborted. Either
    /// way it has exited by the time this returns.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::NotWatching`] unless the loop is running.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Watching {
                return Err(FlagError::NotWatching);
            }
            *state = WatcherState::Stopped;
        }

        let running = self.task.lock().take();
        if let Some(Running { token, mut handle }) = running {
            token.cancel();
            let grace = self.config.stop_grace();
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(
                    source = %self.source.name(),
                    grace_ms = grace.as_millis() as u64,
                    "Watcher did not stop in time, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        tracing::info!(source = %self.source.name(), "Watcher stopped");
        Ok(())
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(running) = self.task.get_mut().take() {
            running.token.cancel();
        }
    }
}

/// State owned by the background task.
struct Worker {
    registry: Arc<dyn FlagSet>,
    source: Arc<dyn SyncSource>,
    cursor: Arc<AtomicU64>,
    backoff: Backoff,
    timing: WatchTiming,
    token: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let mut subscription: Option<Box<dyn Subscription>> = None;

        loop {
            if subscription.is_none() {
                let cursor = self.cursor.load(Ordering::Acquire);
                let opened = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => break,
                    opened = self.source.subscribe(cursor, self.timing) => opened,
                };
                match opened {
                    Ok(sub) => subscription = Some(sub),
                    Err(e) => {
                        tracing::warn!(source = %self.source.name(), error = %e, "Failed to subscribe");
                        if !self.pause().await {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(sub) = subscription.as_mut() else {
                continue;
            };

            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                event = sub.next_event() => event,
            };

            // A stop may have landed while the event was in flight.
            if self.token.is_cancelled() {
                break;
            }

            match event {
                Ok(WatchEvent::Put {
                    key,
                    value,
                    index,
                    previous: _,
                }) => {
                    self.backoff.reset();
                    self.cursor.fetch_max(index, Ordering::AcqRel);
                    self.apply(&key, &value, index).await;
                }
                Ok(WatchEvent::Delete { key, index }) => {
                    self.backoff.reset();
                    self.cursor.fetch_max(index, Ordering::AcqRel);
                    tracing::info!(key = %key, index, "Key deleted, keeping current value");
                }
                Ok(WatchEvent::Resync) => match self.resync().await {
                    Some(cursor) => {
                        self.backoff.reset();
                        sub.resume_from(cursor);
                    }
                    None => {
                        if !self.pause().await {
                            break;
                        }
                    }
                },
                Err(SourceError::Closed) => {
                    tracing::warn!(source = %self.source.name(), "Subscription closed, reopening");
                    subscription = None;
                    if !self.pause().await {
                        break;
                    }
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(source = %self.source.name(), error = %e, "Watch failed, backing off");
                    } else {
                        tracing::error!(source = %self.source.name(), error = %e, "Watch failed, backing off");
                    }
                    if !self.pause().await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(source = %self.source.name(), "Watch loop exited");
    }

    /// Sleep for the next backoff delay. Returns false if cancelled meanwhile.
    async fn pause(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn apply(&self, key: &str, value: &str, index: u64) {
        let name = match self.source.flag_name(key) {
            Ok(name) => name,
            Err(KeyRejection::Nested) => {
                tracing::warn!(key = %key, "Ignoring nested key");
                return;
            }
            Err(_) => return,
        };

        let Some(info) = self.registry.lookup(name) else {
            return;
        };

        // Intentionally permissive: a write to a static key is skipped, never
        // an error, so an external writer cannot stall the loop with it.
        if !info.dynamic {
            tracing::debug!(flag = %name, index, "Ignoring update for non-dynamic flag");
            return;
        }

        match self.registry.set_by_name(name, value) {
            Ok(()) => {
                tracing::info!(flag = %name, index, "Applied flag update");
            }
            Err(e) => {
                tracing::warn!(flag = %name, key = %key, index, error = %e, "Rejected flag update");
                // Restore the running value, never the store's previous one.
                let target = info.changed.then_some(info.value.as_str());
                if target == Some(value) {
                    tracing::debug!(key = %key, index, "Rejected value equals running value, not rolling back");
                    return;
                }
                self.rollback(key, target, index).await;
            }
        }
    }

    async fn rollback(&self, key: &str, target: Option<&str>, index: u64) {
        if !self.source.supports_rollback() {
            tracing::warn!(
                source = %self.source.name(),
                key = %key,
                "Source is read-only, rejected value stays in place"
            );
            return;
        }

        match self.source.restore(key, target, index).await {
            Ok(()) => {
                tracing::info!(key = %key, restored = ?target, "Rolled back rejected value");
            }
            Err(SourceError::CompareFailed(_)) => {
                tracing::info!(key = %key, index, "Rollback skipped, someone else fixed it");
            }
            Err(e) => {
                tracing::warn!(key = %key, index, error = %e, "Rollback failed");
            }
        }
    }

    /// Re-list and apply dynamic flags. Returns the cursor to resume from.
    async fn resync(&self) -> Option<u64> {
        let listed = tokio::select! {
            biased;
            _ = self.token.cancelled() => return None,
            listed = self.source.list_all() => listed,
        };
        let listing = match listed {
            Ok(listing) => listing,
            Err(e) => {
                tracing::warn!(source = %self.source.name(), error = %e, "Resync listing failed");
                return None;
            }
        };
        if self.token.is_cancelled() {
            return None;
        }

        let mut updated = 0usize;
        for entry in &listing.entries {
            let Ok(name) = self.source.flag_name(&entry.key) else {
                continue;
            };
            let Some(info) = self.registry.lookup(name) else {
                continue;
            };
            if !info.dynamic || info.value == entry.value {
                continue;
            }
            match self.registry.set_by_name(name, &entry.value) {
                Ok(()) => updated += 1,
                Err(e) => {
                    tracing::warn!(flag = %name, key = %entry.key, error = %e, "Rejected value during resync");
                }
            }
        }

        let cursor = self.cursor.fetch_max(listing.cursor, Ordering::AcqRel).max(listing.cursor);
        tracing::info!(source = %self.source.name(), updated, cursor, "Resync complete");
        Some(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FlagRegistry;
    use crate::sources::{KvSource, KvStore, Listing, MemoryKvStore, SourceResult};
    use crate::watcher::BackoffPolicy;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            backoff: BackoffPolicy {
                base_delay_ms: 10,
                max_delay_ms: 50,
                jitter: 0.0,
            },
            poll_timeout_ms: 100,
            stop_grace_ms: 1_000,
            ..WatcherConfig::default()
        }
    }

    fn setup(store: &Arc<MemoryKvStore>) -> (Arc<FlagRegistry>, Reconciler) {
        let registry = Arc::new(FlagRegistry::new());
        let source = KvSource::new(Arc::clone(store) as Arc<dyn KvStore>, "/flags/svc");
        let watcher = Reconciler::with_config(
            Arc::clone(&registry) as Arc<dyn FlagSet>,
            Arc::new(source),
            fast_config(),
        );
        (registry, watcher)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let store = Arc::new(MemoryKvStore::new());
        let (_registry, watcher) = setup(&store);

        assert_eq!(watcher.state(), WatcherState::Uninitialized);
        assert!(matches!(watcher.start(), Err(FlagError::NotInitialized)));
        assert!(matches!(watcher.stop().await, Err(FlagError::NotWatching)));

        watcher.initialize().await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Initialized);
        assert!(matches!(
            watcher.initialize().await,
            Err(FlagError::AlreadyInitialized)
        ));

        watcher.start().unwrap();
        assert_eq!(watcher.state(), WatcherState::Watching);
        assert!(matches!(watcher.start(), Err(FlagError::AlreadyWatching)));

        watcher.stop().await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert!(matches!(watcher.start(), Err(FlagError::Stopped)));
        assert!(matches!(watcher.stop().await, Err(FlagError::NotWatching)));
    }

    #[test]
    fn test_start_without_runtime() {
        let store = Arc::new(MemoryKvStore::new());
        let (_registry, watcher) = setup(&store);
        *watcher.state.lock() = WatcherState::Initialized;
        assert!(matches!(watcher.start(), Err(FlagError::NoRuntime)));
        assert_eq!(watcher.state(), WatcherState::Initialized);
    }

    #[tokio::test]
    async fn test_initialize_reports_every_bad_key() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("/flags/svc/count", "5");
        store.put("/flags/svc/region", "us-east-1");
        store.put("/flags/svc/port", "abc");
        store.put("/flags/svc/unknown", "1");
        store.put("/flags/svc/nested/count", "7");
        let (registry, watcher) = setup(&store);

        let count = registry.dynamic("count", 1i64, "").unwrap();
        let region = registry
            .static_flag("region", String::from("eu-west-1"), "")
            .unwrap();
        let port = registry.dynamic("port", 8080u16, "").unwrap();

        let err = watcher.initialize().await.unwrap_err();
        let FlagError::Initialize(errors) = err else {
            panic!("expected initialize errors");
        };
        let mut keys: Vec<_> = errors.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["/flags/svc/port", "/flags/svc/unknown"]);

        assert_eq!(*count.get(), 5);
        assert_eq!(region.get().as_str(), "us-east-1");
        assert_eq!(*port.get(), 8080);
        assert_eq!(watcher.state(), WatcherState::Initialized);
        assert_eq!(watcher.cursor(), store.index());
    }

    #[tokio::test]
    async fn test_failed_listing_allows_retry() {
        let store = Arc::new(MemoryKvStore::new());
        let (_registry, watcher) = setup(&store);

        store.set_available(false);
        assert!(matches!(
            watcher.initialize().await,
            Err(FlagError::Source(SourceError::Unavailable(_)))
        ));
        assert_eq!(watcher.state(), WatcherState::Uninitialized);

        store.set_available(true);
        watcher.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_updates_apply_and_bad_values_roll_back() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("/flags/svc/counter", "10");
        let (registry, watcher) = setup(&store);
        let counter = registry.dynamic("counter", 0i64, "").unwrap();

        watcher.initialize().await.unwrap();
        assert_eq!(*counter.get(), 10);
        watcher.start().unwrap();

        store.put("/flags/svc/counter", "20");
        assert!(eventually(|| *counter.get() == 20).await);

        store.put("/flags/svc/counter", "notanumber");
        assert!(eventually(|| store.get("/flags/svc/counter").as_deref() == Some("20")).await);
        assert_eq!(*counter.get(), 20);

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_new_key_is_deleted() {
        let store = Arc::new(MemoryKvStore::new());
        let (registry, watcher) = setup(&store);
        let ratio = registry.dynamic("ratio", 0.5f64, "").unwrap();

        watcher.initialize().await.unwrap();
        watcher.start().unwrap();

        store.put("/flags/svc/ratio", "half");
        assert!(eventually(|| store.get("/flags/svc/ratio").is_none()).await);
        assert_eq!(*ratio.get(), 0.5);

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_static_and_unknown_updates_are_skipped() {
        let store = Arc::new(MemoryKvStore::new());
        let (registry, watcher) = setup(&store);
        let region = registry
            .static_flag("region", String::from("eu"), "")
            .unwrap();
        let count = registry.dynamic("count", 0u32, "").unwrap();

        watcher.initialize().await.unwrap();
        watcher.start().unwrap();

        store.put("/flags/svc/region", "us");
        store.put("/flags/svc/mystery", "1");
        store.put("/flags/svc/count", "3");
        assert!(eventually(|| *count.get() == 3).await);

        assert_eq!(region.get().as_str(), "eu");
        assert_eq!(store.get("/flags/svc/region").as_deref(), Some("us"));
        assert_eq!(store.get("/flags/svc/mystery").as_deref(), Some("1"));

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_keeps_value() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("/flags/svc/count", "4");
        let (registry, watcher) = setup(&store);
        let count = registry.dynamic("count", 0u32, "").unwrap();

        watcher.initialize().await.unwrap();
        watcher.start().unwrap();

        let index = store.delete("/flags/svc/count").unwrap();
        assert!(eventually(|| watcher.cursor() >= index).await);
        assert_eq!(*count.get(), 4);

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_changes_after_stop() {
        let store = Arc::new(MemoryKvStore::new());
        let (registry, watcher) = setup(&store);
        let count = registry.dynamic("count", 1u32, "").unwrap();

        watcher.initialize().await.unwrap();
        watcher.start().unwrap();
        watcher.stop().await.unwrap();

        store.put("/flags/svc/count", "2");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*count.get(), 1);
    }

    #[tokio::test]
    async fn test_recovers_from_unavailable_store() {
        let store = Arc::new(MemoryKvStore::new());
        let (registry, watcher) = setup(&store);
        let count = registry.dynamic("count", 1u32, "").unwrap();

        watcher.initialize().await.unwrap();
        store.set_available(false);
        watcher.start().unwrap();

        store.put("/flags/svc/count", "9");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*count.get(), 1);

        store.set_available(true);
        assert!(eventually(|| *count.get() == 9).await);

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleared_index_resyncs_dynamic_flags() {
        let store = Arc::new(MemoryKvStore::new().with_history_limit(2));
        store.put("/flags/svc/count", "1");
        let (registry, watcher) = setup(&store);
        let count = registry.dynamic("count", 0u32, "").unwrap();
        let region = registry
            .static_flag("region", String::from("eu"), "")
            .unwrap();

        watcher.initialize().await.unwrap();

        for i in 2..=6 {
            store.put("/flags/svc/count", &i.to_string());
        }
        store.put("/flags/svc/region", "us");
        store.put("/flags/svc/filler", "x");
        store.put("/flags/svc/filler", "y");

        watcher.start().unwrap();
        assert!(eventually(|| *count.get() == 6).await);
        assert!(eventually(|| watcher.cursor() == store.index()).await);
        assert_eq!(region.get().as_str(), "eu");

        store.put("/flags/svc/count", "7");
        assert!(eventually(|| *count.get() == 7).await);

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_back_to_back_bad_writes_settle_on_running_value() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("/flags/svc/counter", "10");
        let (registry, watcher) = setup(&store);
        let counter = registry.dynamic("counter", 0i64, "").unwrap();

        watcher.initialize().await.unwrap();
        watcher.start().unwrap();

        store.put("/flags/svc/counter", "20");
        assert!(eventually(|| *counter.get() == 20).await);

        store.put("/flags/svc/counter", "bad-one");
        store.put("/flags/svc/counter", "bad-two");
        assert!(eventually(|| store.get("/flags/svc/counter").as_deref() == Some("20")).await);
        assert!(eventually(|| watcher.cursor() == store.index()).await);

        let settled = store.index();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.index(), settled);
        assert_eq!(store.get("/flags/svc/counter").as_deref(), Some("20"));
        assert_eq!(*counter.get(), 20);

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_initial_value_is_deleted_on_next_rejection() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("/flags/svc/port", "abc");
        let (registry, watcher) = setup(&store);
        let port = registry.dynamic("port", 8080u16, "").unwrap();

        assert!(matches!(watcher.initialize().await, Err(FlagError::Initialize(_))));
        watcher.start().unwrap();

        store.put("/flags/svc/port", "xyz");
        assert!(eventually(|| store.get("/flags/svc/port").is_none()).await);
        assert!(eventually(|| watcher.cursor() == store.index()).await);

        let settled = store.index();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.index(), settled);
        assert_eq!(*port.get(), 8080);

        watcher.stop().await.unwrap();
    }

    /// Source driven by a queue of events; its restore never finishes.
    #[derive(Default)]
    struct Script {
        events: Mutex<VecDeque<SourceResult<WatchEvent>>>,
        timings: Mutex<Vec<WatchTiming>>,
        restore_started: AtomicBool,
        restore_dropped: AtomicBool,
    }

    struct ScriptedSource(Arc<Script>);

    struct ScriptedSubscription(Arc<Script>);

    struct DropFlag(Arc<Script>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.restore_dropped.store(true, Ordering::Release);
        }
    }

    #[async_trait]
    impl SyncSource for ScriptedSource {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        fn namespace(&self) -> &str {
            "/flags/svc"
        }

        async fn list_all(&self) -> SourceResult<Listing> {
            Ok(Listing::default())
        }

        async fn subscribe(
            &self,
            _cursor: u64,
            timing: WatchTiming,
        ) -> SourceResult<Box<dyn Subscription>> {
            self.0.timings.lock().push(timing);
            Ok(Box::new(ScriptedSubscription(Arc::clone(&self.0))))
        }

        fn supports_rollback(&self) -> bool {
            true
        }

        async fn restore(&self, _key: &str, _value: Option<&str>, _index: u64) -> SourceResult<()> {
            let _flag = DropFlag(Arc::clone(&self.0));
            self.0.restore_started.store(true, Ordering::Release);
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[async_trait]
    impl Subscription for ScriptedSubscription {
        async fn next_event(&mut self) -> SourceResult<WatchEvent> {
            let next = self.0.events.lock().pop_front();
            match next {
                Some(event) => event,
                None => std::future::pending::<SourceResult<WatchEvent>>().await,
            }
        }
    }

    fn put(key: &str, value: &str, index: u64) -> SourceResult<WatchEvent> {
        Ok(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
            index,
            previous: None,
        })
    }

    #[tokio::test]
    async fn test_subscriptions_use_configured_timing() {
        let script = Arc::new(Script::default());
        let config = WatcherConfig {
            poll_timeout_ms: 1_234,
            debounce_ms: 7,
            ..fast_config()
        };
        let watcher = Reconciler::with_config(
            Arc::new(FlagRegistry::new()),
            Arc::new(ScriptedSource(Arc::clone(&script))),
            config,
        );

        watcher.initialize().await.unwrap();
        watcher.start().unwrap();
        assert!(eventually(|| !script.timings.lock().is_empty()).await);
        assert_eq!(
            script.timings.lock()[0],
            WatchTiming {
                poll_timeout: Duration::from_millis(1_234),
                debounce: Duration::from_millis(7),
            }
        );

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_transient_watch_error_keeps_loop_running() {
        let script = Arc::new(Script::default());
        {
            let mut events = script.events.lock();
            events.push_back(Err(SourceError::Malformed("garbage".to_string())));
            events.push_back(put("/flags/svc/count", "5", 3));
        }
        let registry = Arc::new(FlagRegistry::new());
        let count = registry.dynamic("count", 1u32, "").unwrap();
        let watcher = Reconciler::with_config(
            Arc::clone(&registry) as Arc<dyn FlagSet>,
            Arc::new(ScriptedSource(Arc::clone(&script))),
            fast_config(),
        );

        watcher.initialize().await.unwrap();
        watcher.start().unwrap();
        assert!(eventually(|| *count.get() == 5).await);
        assert_eq!(watcher.cursor(), 3);
        assert_eq!(script.timings.lock().len(), 1);

        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_aborts_loop_stuck_past_grace() {
        let script = Arc::new(Script::default());
        script.events.lock().push_back(put("/flags/svc/count", "bad", 1));
        let registry = Arc::new(FlagRegistry::new());
        let count = registry.dynamic("count", 1u32, "").unwrap();
        let config = WatcherConfig {
            stop_grace_ms: 50,
            ..fast_config()
        };
        let watcher = Reconciler::with_config(
            Arc::clone(&registry) as Arc<dyn FlagSet>,
            Arc::new(ScriptedSource(Arc::clone(&script))),
            config,
        );

        watcher.initialize().await.unwrap();
        watcher.start().unwrap();
        assert!(eventually(|| script.restore_started.load(Ordering::Acquire)).await);

        let stopped = tokio::time::timeout(Duration::from_secs(2), watcher.stop()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
        assert!(script.restore_dropped.load(Ordering::Acquire));
        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert_eq!(*count.get(), 1);
    }
}
