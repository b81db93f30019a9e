//! # bucketlog Engine
//!
//! Eventually consistent key-value storage on top of an object store.
//!
//! This crate provides:
//! - Manifest folding from an append-only log of merge patches
//! - Optimistic writes through a persistent operation queue
//! - Snapshot compaction and garbage collection of the log
//! - Adaptive correction of client clock skew
//! - Subscriptions driven by a poll task
//! - Offline mode with deferred writes and a cached manifest
//! - One-way replication that can run in both directions
//!
//! ## Architecture
//!
//! A write goes through four stages:
//! 1. The values are proposed to the [`OperationQueue`] and become
//!    visible to local reads immediately
//! 2. Their content is uploaded as ordinary objects
//! 3. A log entry naming the new versions is written under a key that
//!    sorts by time, newest first
//! 4. A later fold sees the entry and confirms the operation
//!
//! Readers list the log, replay it on top of the newest snapshot, and
//! overlay their own pending writes.
//!
//! ## Key Invariants
//!
//! - Log entries are immutable once written
//! - Log keys from one session never go backwards
//! - Entries whose timestamp disagrees with the store clock are ignored
//! - A snapshot only covers entries older than the settle window
//! - A client always reads its own pending writes

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod clock;
mod config;
mod content;
mod error;
mod manifest;
mod mirror;
mod queue;
mod syncer;

pub use client::Client;
pub use clock::ClockContext;
pub use config::{ClientConfig, Durability, SyncConfig};
pub use content::ContentStore;
pub use error::{EngineError, EngineResult};
pub use manifest::{
    Change, Manifest, Notification, ProvenanceMap, SubscriptionId, LOCAL_VERSION,
};
pub use mirror::{
    checkpoint_reference, load_checkpoint, replicate, Checkpoint, Mirror, ReplicationReport,
    DEFAULT_LAG, MIRROR_PREFIX,
};
pub use queue::{OperationHandle, OperationQueue, RestoredOperation, ValueSet};
pub use syncer::{LogEntry, Syncer};

pub use bucketlog_protocol::{Reference, ResolvedReference};
