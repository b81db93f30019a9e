//! In-memory stores for testing.

use crate::error::{StorageError, StorageResult};
use crate::local::LocalStore;
use crate::object::{GetOptions, GetOutput, GetStatus, ListEntry, ObjectStore, PutOutput};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: Option<String>,
    etag: String,
    last_modified: u64,
    /// `None` is a delete marker.
    body: Option<Bytes>,
}

type Bucket = BTreeMap<String, Vec<StoredVersion>>;

/// Number of requests served, per verb.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    /// GET requests.
    pub gets: u64,
    /// PUT requests.
    pub puts: u64,
    /// DELETE requests.
    pub deletes: u64,
    /// LIST requests.
    pub lists: u64,
}

/// An in-memory S3-style bucket store.
///
/// This store is suitable for:
/// - Unit and integration tests
/// - Simulating several clients sharing one bucket in a single process
///
/// Buckets are created on first write. The server clock can be shifted
/// with [`InMemoryObjectStore::set_clock_offset`] to simulate skew
/// between clients and the store, and PUT failures can be injected with
/// [`InMemoryObjectStore::fail_next_puts`].
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across clients.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    buckets: RwLock<HashMap<String, Bucket>>,
    versioning: bool,
    clock_offset_ms: AtomicI64,
    next_version: AtomicU64,
    failing_puts: AtomicU32,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    /// Creates a store with versioning enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::with_versioning(true)
    }

    /// Creates a store with versioning on or off.
    #[must_use]
    pub fn with_versioning(versioning: bool) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            versioning,
            clock_offset_ms: AtomicI64::new(0),
            next_version: AtomicU64::new(1),
            failing_puts: AtomicU32::new(0),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            lists: AtomicU64::new(0),
        }
    }

    /// Returns true if the store assigns version identifiers.
    pub fn versioning(&self) -> bool {
        self.versioning
    }

    /// Shifts the server clock relative to the host clock.
    pub fn set_clock_offset(&self, offset_ms: i64) {
        self.clock_offset_ms.store(offset_ms, Ordering::SeqCst);
    }

    /// Makes the next `count` PUT requests fail with a transport error.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Returns the server's current time in milliseconds since the epoch.
    pub fn server_time(&self) -> u64 {
        let host = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        (host + self.clock_offset_ms.load(Ordering::SeqCst)).max(0) as u64
    }

    /// Returns the live keys of a bucket, ascending.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .get(bucket)
            .map(|b| {
                b.iter()
                    .filter(|(_, versions)| Self::latest(versions).is_some())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the request counters.
    pub fn request_counts(&self) -> RequestCounts {
        RequestCounts {
            gets: self.gets.load(Ordering::SeqCst),
            puts: self.puts.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
            lists: self.lists.load(Ordering::SeqCst),
        }
    }

    fn latest(versions: &[StoredVersion]) -> Option<&StoredVersion> {
        versions.last().filter(|v| v.body.is_some())
    }

    fn etag_for(body: &[u8]) -> String {
        let digest = Sha256::digest(body);
        let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
        format!("\"{hex}\"")
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str, options: GetOptions) -> StorageResult<GetOutput> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let buckets = self.buckets.read();
        let Some(versions) = buckets.get(bucket).and_then(|b| b.get(key)) else {
            return Ok(GetOutput::not_found());
        };

        let found = match (&options.version, self.versioning) {
            (Some(wanted), true) => versions
                .iter()
                .find(|v| v.version_id.as_deref() == Some(wanted.as_str()))
                .filter(|v| v.body.is_some()),
            _ => Self::latest(versions),
        };
        let Some(found) = found else {
            return Ok(GetOutput::not_found());
        };

        if options.if_none_match.as_deref() == Some(found.etag.as_str()) {
            return Ok(GetOutput::not_modified(found.etag.clone()));
        }

        Ok(GetOutput {
            status: GetStatus::Ok,
            etag: Some(found.etag.clone()),
            version_id: found.version_id.clone(),
            last_modified: Some(found.last_modified),
            body: found.body.clone(),
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_type: Option<&str>,
    ) -> StorageResult<PutOutput> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure() {
            return Err(StorageError::transport_retryable("injected PUT failure"));
        }

        let now = self.server_time();
        let etag = Self::etag_for(&body);
        let version_id = self
            .versioning
            .then(|| format!("v{:08}", self.next_version.fetch_add(1, Ordering::SeqCst)));

        let stored = StoredVersion {
            version_id: version_id.clone(),
            etag: etag.clone(),
            last_modified: now,
            body: Some(body),
        };

        let mut buckets = self.buckets.write();
        let versions = buckets
            .entry(bucket.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default();
        if self.versioning {
            versions.push(stored);
        } else {
            *versions = vec![stored];
        }

        Ok(PutOutput {
            etag,
            version_id,
            date: now,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let now = self.server_time();
        let mut buckets = self.buckets.write();
        let Some(b) = buckets.get_mut(bucket) else {
            return Ok(());
        };

        if self.versioning {
            if let Some(versions) = b.get_mut(key) {
                versions.push(StoredVersion {
                    version_id: Some(format!(
                        "v{:08}",
                        self.next_version.fetch_add(1, Ordering::SeqCst)
                    )),
                    etag: String::new(),
                    last_modified: now,
                    body: None,
                });
            }
        } else {
            b.remove(key);
        }
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
    ) -> StorageResult<Vec<ListEntry>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let buckets = self.buckets.read();
        let Some(b) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        Ok(b.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| start_after.map_or(true, |after| k.as_str() > after))
            .filter_map(|(k, versions)| {
                Self::latest(versions).map(|v| ListEntry {
                    key: k.clone(),
                    etag: v.etag.clone(),
                    last_modified: v.last_modified,
                })
            })
            .collect())
    }
}

/// An in-memory local store.
///
/// Clones share the same underlying map, which lets a test "restart" a
/// client by building a new one over a clone of the old store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLocalStore {
    data: std::sync::Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryLocalStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
