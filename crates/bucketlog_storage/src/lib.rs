//! # bucketlog Storage
//!
//! Storage boundaries for bucketlog.
//!
//! This crate provides the two external collaborators the sync engine
//! talks to. Both are **opaque stores** - they do not interpret the
//! bytes they hold.
//!
//! ## Design Principles
//!
//! - The object store is an S3-style bucket: PUT, GET, DELETE, LIST
//! - The local store is a small durable key/value map used for crash
//!   recovery and the offline cache
//! - No knowledge of manifests, log keys or merge patches
//! - Must be `Send + Sync` so one store can back many clients
//!
//! ## Available Stores
//!
//! - [`InMemoryObjectStore`] - versioned in-memory bucket with a settable
//!   server clock and fault injection, for tests
//! - [`InMemoryLocalStore`] - in-memory local store
//! - [`FileLocalStore`] - one file per key in a directory
//!
//! ## Example
//!
//! ```rust
//! use bucketlog_storage::{GetOptions, InMemoryObjectStore, ObjectStore};
//! use bytes::Bytes;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let store = InMemoryObjectStore::new();
//! store.put("bucket", "hello", Bytes::from_static(b"world"), None).await.unwrap();
//! let out = store.get("bucket", "hello", GetOptions::default()).await.unwrap();
//! assert_eq!(out.body.unwrap(), Bytes::from_static(b"world"));
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod local;
mod memory;
mod object;

pub use error::{StorageError, StorageResult};
pub use file::FileLocalStore;
pub use local::LocalStore;
pub use memory::{InMemoryLocalStore, InMemoryObjectStore, RequestCounts};
pub use object::{GetOptions, GetOutput, GetStatus, ListEntry, ObjectStore, PutOutput};
