//! Test fixtures and client helpers.
//!
//! Provides a shared in-memory bucket that any number of clients can be
//! attached to, plus helpers for common test scenarios.

use bucketlog_engine::{Client, ClientConfig, ClockContext, SyncConfig};
use bucketlog_storage::{FileLocalStore, InMemoryLocalStore, InMemoryObjectStore, LocalStore};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Sync settings that compact and collect immediately.
///
/// Useful to exercise snapshots without waiting for real time windows.
pub fn eager_sync_config(compaction_threshold: usize) -> SyncConfig {
    SyncConfig::new()
        .with_compaction_threshold(compaction_threshold)
        .with_settle_window(Duration::ZERO)
        .with_gc_window(Duration::ZERO)
}

/// One bucket in a shared in-memory object store.
pub struct TestBucket {
    /// The store every client of this bucket talks to.
    pub store: Arc<InMemoryObjectStore>,
    /// Default bucket name.
    pub bucket: String,
}

impl TestBucket {
    /// Creates a versioned bucket in a fresh store.
    pub fn new(bucket: impl Into<String>) -> Self {
        init_tracing();
        Self {
            store: Arc::new(InMemoryObjectStore::new()),
            bucket: bucket.into(),
        }
    }

    /// Creates a bucket in a store without versioning.
    pub fn unversioned(bucket: impl Into<String>) -> Self {
        init_tracing();
        Self {
            store: Arc::new(InMemoryObjectStore::with_versioning(false)),
            bucket: bucket.into(),
        }
    }

    /// Creates another bucket in the same store.
    pub fn sibling(&self, bucket: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bucket: bucket.into(),
        }
    }

    /// Default configuration for clients of this bucket.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.bucket.clone()).with_versioning(self.store.versioning())
    }

    /// Creates a client with the default configuration.
    pub fn client(&self) -> Client {
        self.client_with(self.config())
    }

    /// Creates a client with `config`.
    pub fn client_with(&self, config: ClientConfig) -> Client {
        Client::new(config, self.store.clone())
    }

    /// Creates a client whose clock runs `offset_ms` ahead of the host.
    pub fn skewed_client(&self, config: ClientConfig, offset_ms: i64) -> Client {
        self.client_with(config)
            .with_clock(Arc::new(ClockContext::with_offset(offset_ms)))
    }

    /// Creates a client backed by `local` for crash recovery.
    pub fn durable_client(&self, config: ClientConfig, local: Arc<dyn LocalStore>) -> Client {
        self.client_with(config).with_local_store(local)
    }

    /// Returns the live keys of this bucket.
    pub fn keys(&self) -> Vec<String> {
        self.store.keys(&self.bucket)
    }

    /// Returns the live log keys of the manifest at `manifest_key`.
    pub fn log_keys(&self, manifest_key: &str) -> Vec<String> {
        let prefix = format!("{manifest_key}@");
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect()
    }
}

/// A local store that survives simulated restarts.
pub enum TestLocalStore {
    /// Shared in-memory map.
    Memory(InMemoryLocalStore),
    /// Files in a temporary directory.
    File(Arc<FileLocalStore>, TempDir),
}

impl TestLocalStore {
    /// Creates an in-memory local store.
    pub fn memory() -> Self {
        Self::Memory(InMemoryLocalStore::new())
    }

    /// Creates a file-backed local store in a temporary directory.
    pub async fn file() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileLocalStore::open(dir.path())
            .await
            .expect("Failed to open local store");
        Self::File(Arc::new(store), dir)
    }

    /// Returns a handle for a new client session.
    pub fn handle(&self) -> Arc<dyn LocalStore> {
        match self {
            Self::Memory(store) => Arc::new(store.clone()),
            Self::File(store, _) => Arc::clone(store) as Arc<dyn LocalStore>,
        }
    }
}

/// Polls `check` until it returns true, panicking after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
