//! Reconstructs the state of one manifest from its log, and commits new
//! entries to it.
//!
//! # Folding
//!
//! 1. List `<manifest>@` starting after the cursor for `now + list_slack`,
//!    which yields every entry at or before that instant, newest first.
//! 2. Drop keys that do not parse, and keys whose timestamp is further
//!    than `clock_skew_tolerance` from the store's last-modified time.
//! 3. Walk entries newest first. The first snapshot found supplies the
//!    base state; walking stops at its `previous` key, since everything
//!    from there on is already in the snapshot.
//! 4. Replay the walked `update` patches oldest first on top of the base.
//! 5. Confirm pending operations whose label is among the listed keys.
//!
//! When more than `compaction_threshold` entries were replayed, a new
//! snapshot is written covering everything up to the newest settled
//! entry. Entries covered by the snapshot in use and older than it by
//! `gc_window` are deleted.
//!
//! Log entries are immutable, so each is fetched at most once. An entry
//! that vanishes between list and get was collected by another client
//! after it wrote a newer snapshot; the fold restarts.

use crate::clock::ClockContext;
use crate::config::{ClientConfig, SyncConfig};
use crate::error::{EngineError, EngineResult};
use crate::queue::{OperationHandle, OperationQueue};
use bucketlog_protocol::{LogKey, ManifestFile, ManifestState, ManifestUpdate, ResolvedReference};
use bucketlog_storage::{GetOptions, GetStatus, LocalStore, ObjectStore};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONTENT_TYPE: &str = "application/json";

/// One validated log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Parsed key of the entry.
    pub key: LogKey,
    /// Decoded entry body.
    pub file: Arc<ManifestFile>,
}

/// Persisted form of the fold cache.
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    keys: Vec<String>,
    data: Value,
}

#[derive(Debug, Default)]
struct FoldCache {
    state: ManifestState,
    /// Listed keys of the last fold, newest first.
    keys: Vec<String>,
    /// `previous` of the snapshot the last fold started from.
    covered_through: Option<String>,
    pointer_etag: Option<String>,
    /// Newest timestamp seen in a valid listing.
    max_timestamp: u64,
    /// Newest timestamp this session committed.
    last_written: u64,
    folded: bool,
}

enum Pointer {
    Unchanged,
    Changed(Option<String>),
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Folds and commits the log of one manifest.
pub struct Syncer {
    manifest: ResolvedReference,
    store: Arc<dyn ObjectStore>,
    local: Option<Arc<dyn LocalStore>>,
    queue: Arc<OperationQueue>,
    clock: Arc<ClockContext>,
    online: Arc<AtomicBool>,
    session: String,
    config: SyncConfig,
    adaptive_clock: bool,
    minimize_list_calls: bool,
    sequence: AtomicU32,
    cache_loaded: AtomicBool,
    fold_lock: tokio::sync::Mutex<()>,
    cache: Mutex<FoldCache>,
    entries: Mutex<HashMap<String, Arc<ManifestFile>>>,
}

impl Syncer {
    /// Creates a syncer for `manifest`.
    pub fn new(
        manifest: ResolvedReference,
        store: Arc<dyn ObjectStore>,
        local: Option<Arc<dyn LocalStore>>,
        queue: Arc<OperationQueue>,
        clock: Arc<ClockContext>,
        online: Arc<AtomicBool>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            manifest,
            store,
            local,
            queue,
            clock,
            online,
            session: config.session_id.clone(),
            config: config.sync.clone(),
            adaptive_clock: config.adaptive_clock,
            minimize_list_calls: config.minimize_list_calls,
            sequence: AtomicU32::new(0),
            cache_loaded: AtomicBool::new(false),
            fold_lock: tokio::sync::Mutex::new(()),
            cache: Mutex::new(FoldCache::default()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The manifest this syncer folds.
    pub fn manifest(&self) -> &ResolvedReference {
        &self.manifest
    }

    /// Returns the last folded state without touching the network.
    pub fn cached(&self) -> ManifestState {
        self.cache.lock().state.clone()
    }

    /// Keys listed by the last fold, newest first.
    pub fn listed_keys(&self) -> Vec<String> {
        self.cache.lock().keys.clone()
    }

    /// Returns true if the last fold included the entry at `key`, either
    /// because it was listed or because a snapshot covers it.
    pub fn observed(&self, key: &str) -> bool {
        let cache = self.cache.lock();
        cache.keys.iter().any(|k| k == key)
            || cache
                .covered_through
                .as_deref()
                .is_some_and(|previous| key >= previous)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn cache_key(&self) -> String {
        format!("cache/{}", self.manifest)
    }

    /// Returns the current state of the manifest.
    ///
    /// Offline, or when the poll pointer is unchanged, this is the cached
    /// state. A missing log is the empty state.
    ///
    /// # Errors
    ///
    /// Returns store errors, [`EngineError::InvalidManifest`] for a
    /// malformed entry, or [`EngineError::FoldRetriesExhausted`].
    pub async fn get_latest(&self) -> EngineResult<ManifestState> {
        let _fold = self.fold_lock.lock().await;
        self.load_cache().await;

        if !self.is_online() {
            return Ok(self.cached());
        }

        let pointer_etag = if self.minimize_list_calls {
            match self.check_pointer().await? {
                Pointer::Unchanged => return Ok(self.cached()),
                Pointer::Changed(etag) => etag,
            }
        } else {
            None
        };

        let attempts = self.config.max_fold_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(state) = self.fold_once().await? {
                if self.minimize_list_calls {
                    self.cache.lock().pointer_etag = pointer_etag;
                }
                self.persist_cache().await;
                return Ok(state);
            }
            debug!(manifest = %self.manifest, attempt, "log entry vanished, refolding");
        }
        Err(EngineError::FoldRetriesExhausted { attempts })
    }

    async fn check_pointer(&self) -> EngineResult<Pointer> {
        let etag = {
            let cache = self.cache.lock();
            if cache.folded {
                cache.pointer_etag.clone()
            } else {
                None
            }
        };
        let options = match &etag {
            Some(etag) => GetOptions::if_none_match(etag.clone()),
            None => GetOptions::default(),
        };
        let out = self
            .store
            .get(&self.manifest.bucket, &self.manifest.key, options)
            .await?;
        Ok(match out.status {
            GetStatus::NotModified => Pointer::Unchanged,
            GetStatus::Ok => Pointer::Changed(out.etag),
            GetStatus::NotFound => Pointer::Changed(None),
        })
    }

    /// Lists valid log keys, newest first.
    async fn list_log(&self) -> EngineResult<Vec<LogKey>> {
        let cursor = LogKey::cursor(
            &self.manifest.key,
            self.clock.now() + millis(self.config.list_slack),
        )?;
        let listed = self
            .store
            .list(
                &self.manifest.bucket,
                &LogKey::prefix(&self.manifest.key),
                Some(&cursor),
            )
            .await?;

        let tolerance = millis(self.config.clock_skew_tolerance);
        let mut valid = Vec::with_capacity(listed.len());
        for entry in listed {
            let Ok(key) = LogKey::parse(&self.manifest.key, &entry.key) else {
                continue;
            };
            if entry.last_modified.abs_diff(key.timestamp) > tolerance {
                debug!(
                    key = %entry.key,
                    last_modified = entry.last_modified,
                    "ignoring skewed log entry"
                );
                if self.config.delete_invalid_entries {
                    self.delete_entry(&entry.key).await;
                }
                continue;
            }
            valid.push(key);
        }
        Ok(valid)
    }

    async fn fetch_entry(&self, key: &str) -> EngineResult<Option<Arc<ManifestFile>>> {
        if let Some(file) = self.entries.lock().get(key) {
            return Ok(Some(Arc::clone(file)));
        }

        let out = self
            .store
            .get(&self.manifest.bucket, key, GetOptions::default())
            .await?;
        let body = match (out.status, out.body) {
            (GetStatus::Ok, Some(body)) => body,
            _ => return Ok(None),
        };
        let file = ManifestFile::decode(&body).map_err(|e| EngineError::InvalidManifest {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let file = Arc::new(file);
        self.entries
            .lock()
            .insert(key.to_string(), Arc::clone(&file));
        Ok(Some(file))
    }

    async fn delete_entry(&self, key: &str) {
        self.entries.lock().remove(key);
        if let Err(e) = self.store.delete(&self.manifest.bucket, key).await {
            warn!(key, error = %e, "failed to delete log entry");
        }
    }

    /// Folds the log once. `None` means an entry vanished mid-fold.
    async fn fold_once(&self) -> EngineResult<Option<ManifestState>> {
        let keys = self.list_log().await?;
        let names: Vec<String> = keys.iter().map(ToString::to_string).collect();

        let unchanged = {
            let cache = self.cache.lock();
            (cache.folded && cache.keys == names).then(|| cache.state.clone())
        };
        if let Some(state) = unchanged {
            self.queue.observe(names.iter().map(String::as_str)).await;
            return Ok(Some(state));
        }

        // Walk newest first until the snapshot in use covers the rest.
        let mut walked: Vec<(usize, Arc<ManifestFile>)> = Vec::new();
        let mut base: Option<(ManifestState, String, u64)> = None;
        let mut base_key: Option<String> = None;
        let mut covered_from = keys.len();
        for (i, name) in names.iter().enumerate() {
            if let Some((_, previous, _)) = &base {
                if name.as_str() >= previous.as_str() {
                    covered_from = i;
                    break;
                }
            }
            let Some(file) = self.fetch_entry(name).await? else {
                return Ok(None);
            };
            if base.is_none() {
                if let (Some(files), Some(previous)) = (&file.files, &file.previous) {
                    base = Some((files.clone(), previous.clone(), keys[i].timestamp));
                    base_key = Some(name.clone());
                }
            }
            walked.push((i, file));
        }

        let settled_before = self
            .clock
            .now()
            .saturating_sub(millis(self.config.settle_window));
        let settled_count = walked
            .iter()
            .filter(|(i, _)| keys[*i].timestamp < settled_before)
            .count();

        let mut state = base
            .as_ref()
            .map(|(files, _, _)| files.clone())
            .unwrap_or_default();
        let mut settled: Option<(ManifestState, String)> = None;
        for (n, (i, file)) in walked.iter().rev().enumerate() {
            state.apply(&file.update)?;
            if n + 1 == settled_count {
                settled = Some((state.clone(), names[*i].clone()));
            }
        }

        debug!(
            manifest = %self.manifest,
            listed = names.len(),
            replayed = walked.len(),
            files = state.len(),
            "folded manifest log"
        );

        if walked.len() > self.config.compaction_threshold {
            if let Some((files, previous)) = settled {
                // a snapshot covering the base snapshot adds nothing
                let already = base.as_ref().is_some_and(|(_, p, _)| *p == previous)
                    || base_key.as_deref() == Some(previous.as_str());
                if !already {
                    self.compact(files, previous).await;
                }
            }
        }

        if let Some((_, _, snapshot_ts)) = &base {
            let horizon = snapshot_ts.saturating_sub(millis(self.config.gc_window));
            for (key, name) in keys[covered_from..].iter().zip(&names[covered_from..]) {
                if key.timestamp < horizon {
                    debug!(key = %name, "collecting covered log entry");
                    self.delete_entry(name).await;
                }
            }
        }

        let live: HashSet<&str> = names.iter().map(String::as_str).collect();
        self.entries.lock().retain(|k, _| live.contains(k.as_str()));

        {
            let mut cache = self.cache.lock();
            cache.state = state.clone();
            cache.max_timestamp = cache
                .max_timestamp
                .max(keys.first().map_or(0, |k| k.timestamp));
            cache.keys = names.clone();
            cache.covered_through = base.map(|(_, previous, _)| previous);
            cache.folded = true;
        }

        self.queue.observe(names.iter().map(String::as_str)).await;
        Ok(Some(state))
    }

    /// Writes a snapshot of `files` covering the log up to `previous`.
    async fn compact(&self, files: ManifestState, previous: String) {
        let key = match self.next_key() {
            Ok((key, _)) => key,
            Err(e) => {
                warn!(error = %e, "cannot generate snapshot key");
                return;
            }
        };
        let name = key.to_string();
        let body = Bytes::from(ManifestFile::snapshot(files, previous.clone()).encode());
        match self
            .store
            .put(&self.manifest.bucket, &name, body, Some(CONTENT_TYPE))
            .await
        {
            Ok(out) if out.date.abs_diff(key.timestamp) <= millis(self.config.clock_skew_tolerance) => {
                self.note_written(key.timestamp);
                info!(key = %name, covers = %previous, "wrote manifest snapshot");
            }
            Ok(out) => {
                warn!(key = %name, date = out.date, "snapshot outside clock tolerance, discarding");
                self.delete_entry(&name).await;
            }
            Err(e) => warn!(key = %name, error = %e, "failed to write manifest snapshot"),
        }
    }

    /// Generates the next log key for this session, along with the clock
    /// reading it was based on.
    ///
    /// Keys never move backwards: the timestamp is clamped past the newest
    /// one observed and to the newest one written, and the sequence always
    /// increases. The clamp past observed entries goes at most half the
    /// skew tolerance ahead of the clock, so another session's skew cannot
    /// push this session's entries out of tolerance.
    fn next_key(&self) -> EngineResult<(LogKey, u64)> {
        let now = self.clock.now();
        let ceiling = now.saturating_add(millis(self.config.clock_skew_tolerance) / 2);
        let timestamp = {
            let cache = self.cache.lock();
            now.max(cache.max_timestamp.saturating_add(1).min(ceiling))
                .max(cache.last_written)
        };
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = LogKey::new(
            self.manifest.key.clone(),
            timestamp,
            self.session.clone(),
            sequence,
        )?;
        Ok((key, now))
    }

    fn note_written(&self, timestamp: u64) {
        let mut cache = self.cache.lock();
        cache.last_written = cache.last_written.max(timestamp);
    }

    /// Commits `update` as a new log entry on behalf of `handle`.
    ///
    /// The operation is labeled with the entry's key before the entry is
    /// written, so whichever fold observes it first confirms it. An entry
    /// the store dates outside the skew tolerance is deleted; with an
    /// adaptive clock the offset is corrected by the difference between
    /// the store's date and the local clock reading, and the commit
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Offline`], [`EngineError::ClockSkew`], or any
    /// fold or store error. The caller owns cancelling the operation.
    pub async fn commit(
        &self,
        handle: OperationHandle,
        update: &ManifestUpdate,
    ) -> EngineResult<String> {
        if !self.is_online() {
            return Err(EngineError::Offline);
        }

        let body = Bytes::from(ManifestFile::delta(update.clone()).encode());
        let tolerance = millis(self.config.clock_skew_tolerance);
        let mut attempts = 0;
        loop {
            self.get_latest().await?;
            let (key, reading) = self.next_key()?;
            let name = key.to_string();
            self.queue.label(handle, &name, update).await?;

            let out = self
                .store
                .put(&self.manifest.bucket, &name, body.clone(), Some(CONTENT_TYPE))
                .await?;
            let skew_ms = out.date as i64 - key.timestamp as i64;
            if skew_ms.unsigned_abs() <= tolerance {
                self.note_written(key.timestamp);
                debug!(%handle, key = %name, files = update.len(), "committed log entry");
                self.touch_pointer(&name).await;
                return Ok(name);
            }

            attempts += 1;
            warn!(key = %name, skew_ms, attempts, "log entry outside clock tolerance");
            self.delete_entry(&name).await;
            if !self.adaptive_clock || attempts > self.config.max_clock_retries {
                return Err(EngineError::ClockSkew { attempts, skew_ms });
            }
            // the offset tracks the clock's own error, not the clamp
            self.clock.adjust(out.date as i64 - reading as i64);
            info!(offset_ms = self.clock.offset_ms(), "adjusted clock offset");
        }
    }

    async fn touch_pointer(&self, newest: &str) {
        if !self.minimize_list_calls {
            return;
        }
        let body = Bytes::from(newest.to_string());
        if let Err(e) = self
            .store
            .put(&self.manifest.bucket, &self.manifest.key, body, Some("text/plain"))
            .await
        {
            warn!(manifest = %self.manifest, error = %e, "failed to update poll pointer");
        }
    }

    /// Returns valid entries newer than `after`, oldest first.
    ///
    /// Entries collected between list and get are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Offline`] or any store error.
    pub async fn log_since(&self, after: u64) -> EngineResult<Vec<LogEntry>> {
        if !self.is_online() {
            return Err(EngineError::Offline);
        }
        let keys = self.list_log().await?;
        let mut out = Vec::new();
        for key in keys.into_iter().take_while(|k| k.timestamp > after) {
            if let Some(file) = self.fetch_entry(&key.to_string()).await? {
                out.push(LogEntry { key, file });
            }
        }
        out.reverse();
        Ok(out)
    }

    async fn load_cache(&self) {
        if self.cache_loaded.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(local) = &self.local else {
            return;
        };
        let bytes = match local.get(&self.cache_key()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                warn!(manifest = %self.manifest, error = %e, "failed to read manifest cache");
                return;
            }
        };
        let record = serde_json::from_slice::<CacheRecord>(&bytes)
            .map_err(EngineError::from)
            .and_then(|record| {
                let file = ManifestFile::from_value(&record.data)?;
                Ok((record, file))
            });
        match record {
            Ok((record, file)) => {
                let mut cache = self.cache.lock();
                cache.state = file.files.unwrap_or_default();
                cache.max_timestamp = record
                    .keys
                    .first()
                    .and_then(|k| LogKey::parse(&self.manifest.key, k).ok())
                    .map_or(0, |k| k.timestamp);
                cache.keys = record.keys;
                cache.pointer_etag = record.etag;
                cache.folded = true;
                debug!(manifest = %self.manifest, files = cache.state.len(), "loaded manifest cache");
            }
            Err(e) => warn!(manifest = %self.manifest, error = %e, "discarding unreadable manifest cache"),
        }
    }

    async fn persist_cache(&self) {
        let Some(local) = &self.local else {
            return;
        };
        let record = {
            let cache = self.cache.lock();
            let file = match cache.keys.first() {
                Some(newest) => ManifestFile::snapshot(cache.state.clone(), newest.clone()),
                None => ManifestFile::delta(ManifestUpdate::new()),
            };
            CacheRecord {
                etag: cache.pointer_etag.clone(),
                keys: cache.keys.clone(),
                data: file.to_value(),
            }
        };
        let result = match serde_json::to_vec(&record) {
            Ok(bytes) => local.set(&self.cache_key(), bytes).await.map_err(EngineError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(manifest = %self.manifest, error = %e, "failed to persist manifest cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketlog_protocol::FileState;
    use bucketlog_storage::{InMemoryLocalStore, InMemoryObjectStore};

    struct Fixture {
        store: Arc<InMemoryObjectStore>,
        queue: Arc<OperationQueue>,
        online: Arc<AtomicBool>,
        syncer: Syncer,
    }

    fn fixture_with(store: Arc<InMemoryObjectStore>, config: ClientConfig) -> Fixture {
        fixture_full(store, config, ClockContext::new(), None)
    }

    fn fixture_full(
        store: Arc<InMemoryObjectStore>,
        config: ClientConfig,
        clock: ClockContext,
        local: Option<Arc<dyn LocalStore>>,
    ) -> Fixture {
        let queue = Arc::new(OperationQueue::new());
        let online = Arc::new(AtomicBool::new(true));
        let syncer = Syncer::new(
            ResolvedReference::new("b", "manifest.json"),
            store.clone(),
            local,
            queue.clone(),
            Arc::new(clock),
            online.clone(),
            &config,
        );
        Fixture {
            store,
            queue,
            online,
            syncer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryObjectStore::new()), ClientConfig::new("b"))
    }

    fn update(key: &str, version: &str) -> ManifestUpdate {
        let mut update = ManifestUpdate::new();
        update.set(&ResolvedReference::new("b", key), FileState::new(version));
        update
    }

    async fn write(f: &Fixture, update: &ManifestUpdate) -> String {
        let handle = f.queue.propose(Default::default()).await.unwrap();
        f.syncer.commit(handle, update).await.unwrap()
    }

    fn version_of(state: &ManifestState, key: &str) -> Option<String> {
        state
            .get(&ResolvedReference::new("b", key))
            .map(|s| s.version.clone())
    }

    #[tokio::test]
    async fn empty_log_is_empty_state() {
        let f = fixture();
        assert!(f.syncer.get_latest().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_then_fold_confirms() {
        let f = fixture();
        let handle = f.queue.propose(Default::default()).await.unwrap();
        let key = f.syncer.commit(handle, &update("a", "1")).await.unwrap();
        assert_eq!(f.queue.label_of(handle), Some(key));

        let state = f.syncer.get_latest().await.unwrap();
        assert_eq!(version_of(&state, "a").as_deref(), Some("1"));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn later_entries_win_and_delete() {
        let f = fixture();
        write(&f, &update("a", "1")).await;
        write(&f, &update("b", "1")).await;
        write(&f, &update("a", "2")).await;
        let mut delete = ManifestUpdate::new();
        delete.delete(&ResolvedReference::new("b", "b"));
        write(&f, &delete).await;

        let other = fixture_with(f.store.clone(), ClientConfig::new("b"));
        let state = other.syncer.get_latest().await.unwrap();
        assert_eq!(version_of(&state, "a").as_deref(), Some("2"));
        assert_eq!(version_of(&state, "b"), None);
    }

    #[tokio::test]
    async fn keys_are_monotonic_per_session() {
        let f = fixture();
        let mut keys = Vec::new();
        for n in 0..5 {
            keys.push(write(&f, &update("a", &n.to_string())).await);
        }
        // newest first in key order
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.reverse();
        assert_eq!(sorted, keys);
    }

    #[tokio::test]
    async fn unchanged_listing_skips_fetches() {
        let f = fixture();
        write(&f, &update("a", "1")).await;
        f.syncer.get_latest().await.unwrap();
        let before = f.store.request_counts();
        f.syncer.get_latest().await.unwrap();
        let after = f.store.request_counts();
        assert_eq!(after.gets, before.gets);
        assert_eq!(after.lists, before.lists + 1);
    }

    #[tokio::test]
    async fn skewed_entries_are_ignored_and_deleted() {
        let f = fixture();
        write(&f, &update("a", "1")).await;

        // an entry claiming to be 30s older than the store says it is
        let stale = LogKey::new("manifest.json", f.store.server_time() - 30_000, "zz", 0).unwrap();
        let body = ManifestFile::delta(update("a", "bogus")).encode();
        f.store
            .put("b", &stale.to_string(), Bytes::from(body), None)
            .await
            .unwrap();

        let state = f.syncer.get_latest().await.unwrap();
        assert_eq!(version_of(&state, "a").as_deref(), Some("1"));
        assert!(!f.store.keys("b").contains(&stale.to_string()));
    }

    #[tokio::test]
    async fn invalid_entry_is_surfaced() {
        let f = fixture();
        let key = LogKey::new("manifest.json", f.store.server_time(), "zz", 0).unwrap();
        f.store
            .put("b", &key.to_string(), Bytes::from_static(b"{\"nope\": 1}"), None)
            .await
            .unwrap();
        let err = f.syncer.get_latest().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidManifest { .. }));
    }

    #[tokio::test]
    async fn offline_serves_cache() {
        let f = fixture();
        write(&f, &update("a", "1")).await;
        f.syncer.get_latest().await.unwrap();
        f.online.store(false, Ordering::SeqCst);

        let before = f.store.request_counts();
        let state = f.syncer.get_latest().await.unwrap();
        assert_eq!(version_of(&state, "a").as_deref(), Some("1"));
        assert_eq!(f.store.request_counts(), before);

        let handle = f.queue.propose(Default::default()).await.unwrap();
        assert!(matches!(
            f.syncer.commit(handle, &update("a", "2")).await,
            Err(EngineError::Offline)
        ));
    }

    #[tokio::test]
    async fn adaptive_clock_recovers_from_skew() {
        let store = Arc::new(InMemoryObjectStore::new());
        let f = fixture_full(
            store.clone(),
            ClientConfig::new("b"),
            ClockContext::with_offset(60_000),
            None,
        );
        let key = write(&f, &update("a", "1")).await;
        let parsed = LogKey::parse("manifest.json", &key).unwrap();
        assert!(parsed.timestamp.abs_diff(store.server_time()) < 5_000);
        assert!(f.syncer.clock.offset_ms().abs() < 5_000);

        let reader = fixture_with(store, ClientConfig::new("b"));
        let state = reader.syncer.get_latest().await.unwrap();
        assert_eq!(version_of(&state, "a").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn peer_skew_does_not_move_own_clock() {
        let store = Arc::new(InMemoryObjectStore::new());
        let f = fixture_with(store.clone(), ClientConfig::new("b"));

        // another session ran 4.5s ahead; its entry is still within tolerance
        let ahead = LogKey::new("manifest.json", store.server_time() + 4_500, "zz", 0).unwrap();
        let body = ManifestFile::delta(update("a", "peer")).encode();
        store
            .put("b", &ahead.to_string(), Bytes::from(body), None)
            .await
            .unwrap();
        store.set_clock_offset(-600);

        let key = write(&f, &update("a", "own")).await;
        let parsed = LogKey::parse("manifest.json", &key).unwrap();
        assert!(parsed.timestamp.abs_diff(store.server_time()) <= 5_000);
        assert_eq!(f.syncer.clock.offset_ms(), 0);
    }

    #[tokio::test]
    async fn fixed_clock_reports_skew() {
        let store = Arc::new(InMemoryObjectStore::new());
        let f = fixture_full(
            store.clone(),
            ClientConfig::new("b").with_adaptive_clock(false),
            ClockContext::with_offset(-60_000),
            None,
        );
        let handle = f.queue.propose(Default::default()).await.unwrap();
        let err = f.syncer.commit(handle, &update("a", "1")).await.unwrap_err();
        assert!(matches!(err, EngineError::ClockSkew { attempts: 1, .. }));
        // the rejected entry does not linger
        assert!(store.keys("b").is_empty());
    }

    #[tokio::test]
    async fn compaction_writes_settled_snapshot_and_gc_collects() {
        let store = Arc::new(InMemoryObjectStore::new());
        let sync = SyncConfig::new()
            .with_compaction_threshold(3)
            .with_settle_window(Duration::ZERO)
            .with_gc_window(Duration::ZERO);
        let config = ClientConfig::new("b").with_sync(sync);
        let f = fixture_with(store.clone(), config.clone());

        // the fold before the fifth commit sees four entries and compacts
        for n in 0..5 {
            write(&f, &update(&format!("k{n}"), "1")).await;
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        let log_keys = || {
            store
                .keys("b")
                .into_iter()
                .filter(|k| k.starts_with("manifest.json@"))
                .collect::<Vec<_>>()
        };
        assert_eq!(log_keys().len(), 6);

        // the next fold replays from the snapshot and collects what it covers
        let state = f.syncer.get_latest().await.unwrap();
        assert_eq!(state.len(), 5);
        let log = log_keys();
        assert_eq!(log.len(), 2, "log was {log:?}");

        let reader = fixture_with(store.clone(), config);
        assert_eq!(reader.syncer.get_latest().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn poll_pointer_short_circuits_listing() {
        let store = Arc::new(InMemoryObjectStore::new());
        let config = ClientConfig::new("b").with_minimize_list_calls(true);
        let writer = fixture_with(store.clone(), config.clone());
        let reader = fixture_with(store.clone(), config);

        write(&writer, &update("a", "1")).await;
        reader.syncer.get_latest().await.unwrap();

        let before = store.request_counts();
        reader.syncer.get_latest().await.unwrap();
        let after = store.request_counts();
        assert_eq!(after.lists, before.lists);

        write(&writer, &update("a", "2")).await;
        let state = reader.syncer.get_latest().await.unwrap();
        assert_eq!(version_of(&state, "a").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn cache_survives_restart() {
        let store = Arc::new(InMemoryObjectStore::new());
        let local = InMemoryLocalStore::new();
        let f = fixture_full(
            store.clone(),
            ClientConfig::new("b"),
            ClockContext::new(),
            Some(Arc::new(local.clone())),
        );
        write(&f, &update("a", "1")).await;
        f.syncer.get_latest().await.unwrap();

        let restarted = fixture_full(
            store,
            ClientConfig::new("b"),
            ClockContext::new(),
            Some(Arc::new(local)),
        );
        restarted.online.store(false, Ordering::SeqCst);
        let state = restarted.syncer.get_latest().await.unwrap();
        assert_eq!(version_of(&state, "a").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn log_since_is_oldest_first() {
        let f = fixture();
        let first = write(&f, &update("a", "1")).await;
        let second = write(&f, &update("b", "1")).await;

        let entries = f.syncer.log_since(0).await.unwrap();
        let keys: Vec<String> = entries.iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, vec![first.clone(), second]);

        let ts = LogKey::parse("manifest.json", &first).unwrap().timestamp;
        let later = f.syncer.log_since(ts).await.unwrap();
        assert!(later.iter().all(|e| e.key.timestamp > ts));
    }
}
