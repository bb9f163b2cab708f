//! Sync runners
//!
//! Implementations of [`crate::daemon::SyncRunner`]. Computing and applying
//! the cluster diff is delegated to a [`ClusterApplier`]; this module only
//! sequences the apply and the sync tag move.

mod tag_sync;

pub use tag_sync::{ClusterApplier, LogApplier, SyncTagStore, TagSync};
