//! Directory source for Kubernetes-style ConfigMap mounts.

use super::{
    KeyRejection, Listing, SourceEntry, SourceResult, Subscription, SyncSource, WatchEvent, WatchTiming,
};
use crate::error::SourceError;
use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Name of the symlink a ConfigMap mount re-points on every update.
pub const DATA_MARKER: &str = "..data";

/// Prefix of every entry that belongs to the mount machinery itself.
pub const INTERNALS_PREFIX: &str = "..";

/// Source reading one flag per regular file in a directory.
///
/// The file name is the flag name and the file content is the raw value.
/// Names starting with `.` (which includes the `..` internals of a
/// ConfigMap mount) are ignored.
///
/// A ConfigMap volume mounted at `/etc/flags` can be watched either through
/// `/etc/flags/..data` or through the mount root itself, whose entries are
/// symlinks into `..data`. Kubelet publishes updates by writing a fresh
/// timestamped directory and atomically renaming a new `..data` symlink over
/// the old one. The source watches the target and its parent, treats a
/// `..data` rename in either as a swap, re-arms the target watch and asks
/// the caller for a full resync. The resync waits
/// [`WatchTiming::debounce`] for the swap to settle.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_flags::sources::DirectorySource;
///
/// let source = DirectorySource::new("/etc/flags/..data");
/// ```
pub struct DirectorySource {
    dir: PathBuf,
    namespace: String,
    generation: Arc<AtomicU64>,
}

impl DirectorySource {
    /// Create a source for `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            namespace: dir.display().to_string(),
            dir,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The watched directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of directory swaps observed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn absolute_dir(&self) -> SourceResult<PathBuf> {
        if self.dir.is_absolute() {
            Ok(self.dir.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.dir))
        }
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with(INTERNALS_PREFIX)
}

async fn read_flag_file(path: &Path) -> SourceResult<Option<String>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Ok(None);
    }
    Ok(Some(tokio::fs::read_to_string(path).await?))
}

#[async_trait]
impl SyncSource for DirectorySource {
    fn name(&self) -> String {
        format!("dir:{}", self.dir.display())
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn flag_name<'a>(&self, key: &'a str) -> Result<&'a str, KeyRejection> {
        if key.is_empty() || key.contains('/') || key.contains(std::path::MAIN_SEPARATOR) {
            return Err(KeyRejection::Nested);
        }
        if is_hidden(key) {
            return Err(KeyRejection::Hidden);
        }
        Ok(key)
    }

    async fn list_all(&self) -> SourceResult<Listing> {
        let cursor = self.generation();
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_hidden(&name) {
                continue;
            }
            // Follows symlinks: ConfigMap files are links into the data dir.
            if let Some(value) = read_flag_file(&entry.path()).await? {
                entries.push(SourceEntry {
                    key: name,
                    value,
                    index: cursor,
                });
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Listing { entries, cursor })
    }

    async fn subscribe(
        &self,
        _cursor: u64,
        timing: WatchTiming,
    ) -> SourceResult<Box<dyn Subscription>> {
        let dir = self.absolute_dir()?;
        let (parent, dir_name) = match (dir.parent(), dir.file_name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => {
                return Err(SourceError::Watch(format!(
                    "{} has no parent directory",
                    dir.display()
                )));
            }
        };
        // Only the last component may be a symlink that gets swapped, so the
        // parent can be resolved once; event paths are reported against it.
        let parent = parent.canonicalize()?;
        let dir = parent.join(dir_name);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(res.map_err(|e| e.to_string()));
        })
        .map_err(|e| SourceError::Watch(format!("Failed to create directory watcher: {}", e)))?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| SourceError::Watch(format!("Failed to watch {}: {}", parent.display(), e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| SourceError::Watch(format!("Failed to watch {}: {}", dir.display(), e)))?;

        tracing::debug!(dir = %dir.display(), parent = %parent.display(), "Watching flag directory");

        Ok(Box::new(DirectorySubscription {
            watcher,
            events: event_rx,
            dir,
            parent,
            generation: Arc::clone(&self.generation),
            debounce: timing.debounce,
        }))
    }
}

/// Live notify watch; dropping it removes the OS watches.
struct DirectorySubscription {
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<std::result::Result<Event, String>>,
    dir: PathBuf,
    parent: PathBuf,
    generation: Arc<AtomicU64>,
    debounce: Duration,
}

/// What a raw notify event means for the flag directory.
#[derive(Debug, PartialEq, Eq)]
enum Classified {
    Swap,
    File(PathBuf, String),
    Ignore,
}

impl DirectorySubscription {
    fn classify(&self, event: &Event) -> Classified {
        let relevant_kind = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
        if !relevant_kind {
            return Classified::Ignore;
        }
        let swap_kind = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
        );

        let dir_name = self.dir.file_name();
        for path in &event.paths {
            let Some(name) = path.file_name() else {
                continue;
            };
            let parent = path.parent();

            // `..data` next to the target, or the target itself re-pointed.
            if swap_kind
                && parent == Some(self.parent.as_path())
                && (name == DATA_MARKER || Some(name) == dir_name)
            {
                return Classified::Swap;
            }

            // Mount root: `..data` lives inside the watched directory.
            if swap_kind && parent == Some(self.dir.as_path()) && name == DATA_MARKER {
                return Classified::Swap;
            }

            if parent == Some(self.dir.as_path()) {
                let Some(name) = name.to_str() else {
                    continue;
                };
                if !is_hidden(name) {
                    return Classified::File(path.clone(), name.to_string());
                }
            }
        }
        Classified::Ignore
    }

    fn rearm(&mut self) -> SourceResult<()> {
        // The old watch points at the previous snapshot's inode.
        let _ = self.watcher.unwatch(&self.dir);
        self.watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| SourceError::Watch(format!("Failed to re-watch {}: {}", self.dir.display(), e)))
    }

    async fn settle(&mut self) {
        tokio::time::sleep(self.debounce).await;
        // Everything queued so far is covered by the resync.
        while self.events.try_recv().is_ok() {}
    }
}

#[async_trait]
impl Subscription for DirectorySubscription {
    async fn next_event(&mut self) -> SourceResult<WatchEvent> {
        loop {
            let event = match self.events.recv().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(SourceError::Watch(e)),
                None => return Err(SourceError::Closed),
            };

            match self.classify(&event) {
                Classified::Swap => {
                    self.settle().await;
                    self.rearm()?;
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    tracing::info!(dir = %self.dir.display(), generation, "Flag directory swapped");
                    return Ok(WatchEvent::Resync);
                }
                Classified::File(path, key) => match read_flag_file(&path).await {
                    Ok(Some(value)) => {
                        return Ok(WatchEvent::Put {
                            key,
                            value,
                            index: self.generation.load(Ordering::Acquire),
                            previous: None,
                        });
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable flag file");
                        continue;
                    }
                },
                Classified::Ignore => continue,
            }
        }
    }
}
