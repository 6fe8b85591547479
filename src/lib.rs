//! # hotswap-flags
//!
//! Runtime-changeable flags with lock-free reads, validated atomic swaps and
//! background synchronization from a mounted directory or a revisioned
//! key-value store.
//!
//! ## Overview
//!
//! `hotswap-flags` is built from three layers:
//! - [`DynamicValue`](core::DynamicValue): a typed flag whose value is swapped
//!   atomically with `arc-swap`, guarded by validators and observed by notifiers
//! - [`FlagRegistry`](core::FlagRegistry): flags by name, each marked static
//!   or dynamic
//! - [`Reconciler`](watcher::Reconciler): applies a
//!   [`SyncSource`](sources::SyncSource) to the registry once at startup, then
//!   keeps watching it and rolls back values the flags refuse
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hotswap_flags::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> hotswap_flags::Result<()> {
//! let registry = Arc::new(FlagRegistry::new());
//! let timeout = registry.dynamic("request_timeout", Duration::from_secs(2), "Upstream timeout")?;
//! let _listen = registry.static_flag("listen", String::from(":8080"), "Listen address")?;
//!
//! // Settings from a file plus HOTSWAP_FLAGS__* environment overrides.
//! let config = WatcherConfig::load(Some(std::path::Path::new("config/watcher.yaml")))?;
//!
//! // A ConfigMap mounted at /etc/flags, one file per flag. Swap settle time
//! // and long poll deadlines come from the watcher settings.
//! let source = Arc::new(DirectorySource::new("/etc/flags"));
//! let watcher = Reconciler::with_config(registry, source, config);
//! watcher.initialize().await?;
//! watcher.start()?;
//!
//! // Reads never block, even while an update lands.
//! println!("timeout: {:?}", *timeout.get());
//!
//! watcher.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `directory` (default): [`DirectorySource`](sources::DirectorySource) via `notify`
//! - `json` (default): [`Json<T>`](core::Json) flag values via `serde_json`
//! - `remote`: an etcd v2 [`KvStore`](sources::KvStore) via `reqwest`

#![warn(missing_docs, rust_2024_compatibility)]
#![deny(unsafe_code)]

pub mod core;
pub mod error;
pub mod sources;
pub mod watcher;

pub use error::{FlagError, Result};

/// Convenient re-exports for common usage patterns.
pub mod prelude {
    pub use crate::core::{DynamicValue, FlagRegistry, FlagSet, FlagValue, NotifyMode, Validate};
    pub use crate::error::{FlagError, Result, SourceError, ValidationError};
    pub use crate::sources::{KvSource, KvStore, MemoryKvStore, SyncSource};
    pub use crate::watcher::{Reconciler, WatcherConfig, WatcherState};

    #[cfg(feature = "directory")]
    pub use crate::sources::DirectorySource;

    #[cfg(feature = "json")]
    pub use crate::core::Json;
}
