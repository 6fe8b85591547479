//! Reconciliation between a [`SyncSource`](crate::sources::SyncSource) and a flag registry.
//!
//! The [`Reconciler`] owns the lifecycle: a first synchronous pass over the
//! whole source, then one background task that applies changes as they
//! arrive. [`WatcherConfig`] carries its retry and shutdown settings.

mod backoff;
mod reconciler;
mod settings;

pub use reconciler::{Reconciler, WatcherState};
pub use settings::{BackoffPolicy, ENV_PREFIX, WatcherConfig};
