//! Synchronization sources: where external flag values come from.

mod kv;
mod memory;
mod source;

#[cfg(feature = "directory")]
mod directory;

#[cfg(feature = "remote")]
mod etcd;

pub use kv::{KvAction, KvEvent, KvSource, KvStore};
pub use memory::MemoryKvStore;
pub use source::{
    KeyRejection, Listing, SourceEntry, SourceResult, Subscription, SyncSource, WatchEvent,
    WatchTiming,
};

#[cfg(feature = "directory")]
pub use directory::{DATA_MARKER, DirectorySource, INTERNALS_PREFIX};

#[cfg(feature = "remote")]
pub use etcd::{EtcdAuth, EtcdV2Store, EtcdV2StoreBuilder};
