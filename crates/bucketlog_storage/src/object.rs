//! Object store trait definition.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Outcome class of a GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetStatus {
    /// The object was returned (HTTP 200).
    Ok,
    /// The `If-None-Match` etag still matches (HTTP 304).
    NotModified,
    /// No such key or version (HTTP 404).
    NotFound,
}

/// Options for a GET request.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Specific object version to read.
    pub version: Option<String>,
    /// Conditional etag; a match yields [`GetStatus::NotModified`].
    pub if_none_match: Option<String>,
}

impl GetOptions {
    /// Reads a specific version.
    pub fn version(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            if_none_match: None,
        }
    }

    /// Makes the read conditional on the etag having changed.
    pub fn if_none_match(etag: impl Into<String>) -> Self {
        Self {
            version: None,
            if_none_match: Some(etag.into()),
        }
    }
}

/// Response of a GET request.
#[derive(Debug, Clone)]
pub struct GetOutput {
    /// Outcome class.
    pub status: GetStatus,
    /// Entity tag of the returned (or matched) object.
    pub etag: Option<String>,
    /// Version identifier, when the bucket is versioned.
    pub version_id: Option<String>,
    /// Server-side last-modified time in milliseconds since the epoch.
    pub last_modified: Option<u64>,
    /// Object body, present only for [`GetStatus::Ok`].
    pub body: Option<Bytes>,
}

impl GetOutput {
    /// A 404 response.
    pub fn not_found() -> Self {
        Self {
            status: GetStatus::NotFound,
            etag: None,
            version_id: None,
            last_modified: None,
            body: None,
        }
    }

    /// A 304 response.
    pub fn not_modified(etag: impl Into<String>) -> Self {
        Self {
            status: GetStatus::NotModified,
            etag: Some(etag.into()),
            version_id: None,
            last_modified: None,
            body: None,
        }
    }

    /// Returns true for a 404.
    pub fn is_not_found(&self) -> bool {
        self.status == GetStatus::NotFound
    }
}

/// Response of a PUT request.
#[derive(Debug, Clone)]
pub struct PutOutput {
    /// Entity tag of the stored object.
    pub etag: String,
    /// Version identifier, absent when versioning is disabled.
    pub version_id: Option<String>,
    /// Server `Date` header in milliseconds since the epoch.
    pub date: u64,
}

/// One key returned by LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Object key.
    pub key: String,
    /// Entity tag.
    pub etag: String,
    /// Server-side last-modified time in milliseconds since the epoch.
    pub last_modified: u64,
}

/// An S3-compatible object store.
///
/// Implementations own transport concerns (signing, XML parsing, retry on
/// throttling). The engine only sees the outcome.
///
/// # Invariants
///
/// - `list` returns keys in ascending lexicographic order
/// - `list` with `start_after` returns only keys strictly greater than it
/// - a successful `put` is visible to every subsequent `get` and `list`
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads an object.
    async fn get(&self, bucket: &str, key: &str, options: GetOptions) -> StorageResult<GetOutput>;

    /// Writes an object, returning its etag, version and the server date.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<PutOutput>;

    /// Deletes an object. Deleting a missing key succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// Lists keys under `prefix`, ascending, strictly after `start_after`.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
    ) -> StorageResult<Vec<ListEntry>>;
}
