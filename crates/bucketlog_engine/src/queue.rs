//! The operation queue: writes that are proposed but not yet observed in
//! the manifest log.
//!
//! Each operation moves `proposed -> labeled -> confirmed`, or
//! `proposed -> cancelled`. The label is the log key the write will be
//! committed under; a fold that observes that key confirms it.
//!
//! When a [`LocalStore`] is attached, every proposal is persisted before
//! `propose` returns, under `<prefix>/op/<index>` with a monotonically
//! increasing index, so [`OperationQueue::restore`] can resume
//! interrupted writes in their original order after a restart.

use crate::error::{EngineError, EngineResult};
use bucketlog_protocol::{encode, ManifestUpdate, ResolvedReference};
use bucketlog_storage::LocalStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// New values per reference; `None` deletes.
pub type ValueSet = BTreeMap<ResolvedReference, Option<Value>>;

const INDEX_BITS: u32 = 64;

/// Opaque identifier of one proposed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHandle(Uuid);

impl OperationHandle {
    /// Creates a fresh random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A durable record handed to the replay callback of
/// [`OperationQueue::restore`].
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredOperation {
    /// The values the interrupted write proposed.
    pub values: ValueSet,
    /// Log key the write was labeled with, if it reached the commit step.
    pub label: Option<String>,
    /// Uploaded content versions, present whenever `label` is.
    pub versions: Option<ManifestUpdate>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordValue {
    reference: ResolvedReference,
    value: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    handle: OperationHandle,
    values: Vec<RecordValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    versions: Option<Value>,
}

#[derive(Debug)]
struct Operation {
    handle: OperationHandle,
    values: ValueSet,
    label: Option<String>,
    versions: Option<ManifestUpdate>,
    record_key: Option<String>,
}

impl Operation {
    fn record(&self) -> Record {
        Record {
            handle: self.handle,
            values: self
                .values
                .iter()
                .map(|(reference, value)| RecordValue {
                    reference: reference.clone(),
                    value: value.clone(),
                })
                .collect(),
            label: self.label.clone(),
            versions: self.versions.as_ref().map(ManifestUpdate::to_value),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    next_index: u64,
    /// Keyed by proposal order.
    operations: BTreeMap<u64, Operation>,
    handles: HashMap<OperationHandle, u64>,
    labels: HashMap<String, OperationHandle>,
}

impl QueueState {
    fn remove(&mut self, handle: OperationHandle) -> Option<Operation> {
        let seq = self.handles.remove(&handle)?;
        let op = self.operations.remove(&seq)?;
        if let Some(label) = &op.label {
            self.labels.remove(label);
        }
        Some(op)
    }
}

/// Pending writes of one manifest, with an optional durable backing.
pub struct OperationQueue {
    state: Mutex<QueueState>,
    store: Option<Arc<dyn LocalStore>>,
    prefix: String,
    index_loaded: AtomicBool,
}

impl OperationQueue {
    /// Creates a queue that lives in memory only.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store: None,
            prefix: String::new(),
            index_loaded: AtomicBool::new(true),
        }
    }

    /// Creates a queue persisted under `prefix` in `store`.
    pub fn durable(store: Arc<dyn LocalStore>, prefix: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store: Some(store),
            prefix: prefix.into(),
            index_loaded: AtomicBool::new(false),
        }
    }

    fn records_prefix(&self) -> String {
        format!("{}/op/", self.prefix)
    }

    /// Makes sure new record indexes land after every stored one.
    async fn ensure_index(&self, store: &Arc<dyn LocalStore>) -> EngineResult<()> {
        if self.index_loaded.load(Ordering::SeqCst) {
            return Ok(());
        }
        let prefix = self.records_prefix();
        let keys = store.list_keys(&prefix).await?;
        let next = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|idx| bucketlog_protocol::decode(idx, INDEX_BITS).ok())
            .max()
            .map_or(0, |max| max.saturating_add(1));
        let mut state = self.state.lock();
        state.next_index = state.next_index.max(next);
        self.index_loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Records a new write and returns its handle.
    ///
    /// The values are visible through [`OperationQueue::flatten`] as soon
    /// as this returns. With a durable store the record is persisted
    /// first; if that fails nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable record cannot be written.
    pub async fn propose(&self, values: ValueSet) -> EngineResult<OperationHandle> {
        let handle = OperationHandle::new();

        let Some(store) = &self.store else {
            self.insert(handle, values, None);
            return Ok(handle);
        };

        self.ensure_index(store).await?;
        let index = {
            let mut state = self.state.lock();
            state.next_index += 1;
            state.next_index - 1
        };
        let record_key = format!("{}{}", self.records_prefix(), encode(index, INDEX_BITS)?);
        self.insert(handle, values, Some(record_key.clone()));
        let bytes = self.with_operation(handle, |op| serde_json::to_vec(&op.record()));

        let stored = match bytes {
            Some(Ok(bytes)) => store.set(&record_key, bytes).await.map_err(EngineError::from),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Cancelled),
        };
        if let Err(e) = stored {
            self.state.lock().remove(handle);
            return Err(e);
        }
        debug!(%handle, record = %record_key, "proposed operation");
        Ok(handle)
    }

    fn insert(&self, handle: OperationHandle, values: ValueSet, record_key: Option<String>) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.handles.insert(handle, seq);
        state.operations.insert(
            seq,
            Operation {
                handle,
                values,
                label: None,
                versions: None,
                record_key,
            },
        );
    }

    fn with_operation<T>(&self, handle: OperationHandle, f: impl FnOnce(&Operation) -> T) -> Option<T> {
        let state = self.state.lock();
        let seq = state.handles.get(&handle)?;
        state.operations.get(seq).map(f)
    }

    /// Labels an operation with the log key it is being committed under,
    /// along with the content versions that key will record.
    ///
    /// A relabel replaces the previous label.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] if the operation is gone.
    pub async fn label(
        &self,
        handle: OperationHandle,
        label: &str,
        versions: &ManifestUpdate,
    ) -> EngineResult<()> {
        let persisted = {
            let mut state = self.state.lock();
            let seq = *state.handles.get(&handle).ok_or(EngineError::Cancelled)?;
            let previous = state.operations.get_mut(&seq).and_then(|op| {
                op.versions = Some(versions.clone());
                op.label.replace(label.to_string())
            });
            if let Some(previous) = previous {
                state.labels.remove(&previous);
            }
            state.labels.insert(label.to_string(), handle);
            state
                .operations
                .get(&seq)
                .and_then(|op| op.record_key.clone().map(|key| (key, op.record())))
        };

        if let (Some(store), Some((key, record))) = (&self.store, persisted) {
            let result = match serde_json::to_vec(&record) {
                Ok(bytes) => store.set(&key, bytes).await.map_err(EngineError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(%handle, label, error = %e, "failed to persist operation label");
            }
        }
        Ok(())
    }

    /// Confirms the operation labeled `label`, if any.
    pub async fn confirm(&self, label: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.labels.get(label).copied() {
                Some(handle) => state.remove(handle),
                None => None,
            }
        };
        match removed {
            Some(op) => {
                debug!(handle = %op.handle, label, "confirmed operation");
                self.forget(op).await;
                true
            }
            None => false,
        }
    }

    /// Confirms every operation whose label appears in `keys`.
    pub async fn observe<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        let matched: Vec<String> = {
            let state = self.state.lock();
            if state.labels.is_empty() {
                return 0;
            }
            keys.into_iter()
                .filter(|k| state.labels.contains_key(*k))
                .map(str::to_string)
                .collect()
        };
        let mut confirmed = 0;
        for label in matched {
            if self.confirm(&label).await {
                confirmed += 1;
            }
        }
        confirmed
    }

    /// Cancels an operation, dropping its values and label.
    pub async fn cancel(&self, handle: OperationHandle) -> bool {
        let removed = self.state.lock().remove(handle);
        match removed {
            Some(op) => {
                debug!(%handle, "cancelled operation");
                self.forget(op).await;
                true
            }
            None => false,
        }
    }

    async fn forget(&self, op: Operation) {
        if let (Some(store), Some(key)) = (&self.store, op.record_key) {
            if let Err(e) = store.delete(&key).await {
                warn!(handle = %op.handle, error = %e, "failed to delete operation record");
            }
        }
    }

    /// Returns every pending value, later proposals overriding earlier.
    pub fn flatten(&self) -> ValueSet {
        let state = self.state.lock();
        let mut out = ValueSet::new();
        for op in state.operations.values() {
            for (reference, value) in &op.values {
                out.insert(reference.clone(), value.clone());
            }
        }
        out
    }

    /// Returns the pending value of one reference: `None` if no pending
    /// operation touches it, `Some(None)` for a pending deletion.
    pub fn get(&self, reference: &ResolvedReference) -> Option<Option<Value>> {
        let state = self.state.lock();
        state
            .operations
            .values()
            .rev()
            .find_map(|op| op.values.get(reference).cloned())
    }

    /// Returns the label of an operation, if it has one.
    pub fn label_of(&self, handle: OperationHandle) -> Option<String> {
        self.with_operation(handle, |op| op.label.clone()).flatten()
    }

    /// Returns true if the operation is still pending.
    pub fn contains(&self, handle: OperationHandle) -> bool {
        self.state.lock().handles.contains_key(&handle)
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.state.lock().operations.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replays every durable record left by a previous process.
    ///
    /// Records are handed to `replay` in their original order; each is
    /// deleted once its replay succeeds. Records of operations proposed
    /// by this queue are skipped. Replay stops at the first error,
    /// leaving that record and every later one in place.
    ///
    /// # Errors
    ///
    /// Returns the first error from the store or from `replay`.
    pub async fn restore<F, Fut>(&self, mut replay: F) -> EngineResult<usize>
    where
        F: FnMut(RestoredOperation) -> Fut,
        Fut: Future<Output = EngineResult<()>>,
    {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        self.ensure_index(store).await?;

        let keys = store.list_keys(&self.records_prefix()).await?;
        let mut replayed = 0;
        for key in keys {
            let Some(bytes) = store.get(&key).await? else {
                continue;
            };
            let record: Record = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(record = %key, error = %e, "dropping unreadable operation record");
                    store.delete(&key).await?;
                    continue;
                }
            };
            if self.contains(record.handle) {
                continue;
            }

            let versions = match &record.versions {
                Some(value) => Some(ManifestUpdate::from_value(value)?),
                None => None,
            };
            let op = RestoredOperation {
                values: record
                    .values
                    .into_iter()
                    .map(|v| (v.reference, v.value))
                    .collect(),
                label: record.label,
                versions,
            };
            debug!(record = %key, labeled = op.label.is_some(), "replaying operation");
            replay(op).await?;
            store.delete(&key).await?;
            replayed += 1;
        }
        Ok(replayed)
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketlog_protocol::FileState;
    use bucketlog_storage::InMemoryLocalStore;
    use serde_json::json;

    fn r(key: &str) -> ResolvedReference {
        ResolvedReference::new("b", key)
    }

    fn set(pairs: &[(&str, Option<Value>)]) -> ValueSet {
        pairs.iter().map(|(k, v)| (r(k), v.clone())).collect()
    }

    fn versions(key: &str) -> ManifestUpdate {
        let mut update = ManifestUpdate::new();
        update.set(&r(key), FileState::new("v1"));
        update
    }

    #[tokio::test]
    async fn propose_label_confirm() {
        let queue = OperationQueue::new();
        let handle = queue.propose(set(&[("a", Some(json!(1)))])).await.unwrap();
        assert_eq!(queue.flatten().get(&r("a")), Some(&Some(json!(1))));

        queue.label(handle, "m@key1", &versions("a")).await.unwrap();
        assert_eq!(queue.label_of(handle).as_deref(), Some("m@key1"));
        assert!(queue.confirm("m@key1").await);
        assert!(queue.flatten().is_empty());
        assert!(!queue.confirm("m@key1").await);
    }

    #[tokio::test]
    async fn cancel_without_label() {
        let queue = OperationQueue::new();
        let handle = queue.propose(set(&[("a", None)])).await.unwrap();
        assert_eq!(queue.get(&r("a")), Some(None));
        assert!(queue.cancel(handle).await);
        assert!(queue.flatten().is_empty());
        assert_eq!(queue.get(&r("a")), None);
    }

    #[tokio::test]
    async fn relabel_drops_old_label() {
        let queue = OperationQueue::new();
        let handle = queue.propose(set(&[("a", Some(json!(1)))])).await.unwrap();
        queue.label(handle, "first", &versions("a")).await.unwrap();
        queue.label(handle, "second", &versions("a")).await.unwrap();
        assert!(!queue.confirm("first").await);
        assert!(queue.confirm("second").await);
    }

    #[tokio::test]
    async fn label_after_cancel_fails() {
        let queue = OperationQueue::new();
        let handle = queue.propose(set(&[("a", Some(json!(1)))])).await.unwrap();
        queue.cancel(handle).await;
        assert!(matches!(
            queue.label(handle, "k", &versions("a")).await,
            Err(EngineError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn latest_proposal_wins_regardless_of_completion_order() {
        let queue = OperationQueue::new();
        let first = queue.propose(set(&[("a", Some(json!("first")))])).await.unwrap();
        let second = queue.propose(set(&[("a", Some(json!("second")))])).await.unwrap();
        let third = queue
            .propose(set(&[("a", Some(json!("third"))), ("b", Some(json!(0)))]))
            .await
            .unwrap();

        queue.label(third, "k3", &versions("a")).await.unwrap();
        queue.label(first, "k1", &versions("a")).await.unwrap();
        assert_eq!(queue.get(&r("a")), Some(Some(json!("third"))));

        // the newest proposal completes first
        queue.confirm("k3").await;
        assert_eq!(queue.get(&r("a")), Some(Some(json!("second"))));
        assert_eq!(queue.get(&r("b")), None);

        queue.cancel(second).await;
        assert_eq!(queue.flatten(), set(&[("a", Some(json!("first")))]));

        queue.confirm("k1").await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn observe_confirms_matching_labels_only() {
        let queue = OperationQueue::new();
        let a = queue.propose(set(&[("a", Some(json!(1)))])).await.unwrap();
        let b = queue.propose(set(&[("b", Some(json!(2)))])).await.unwrap();
        queue.label(a, "ka", &versions("a")).await.unwrap();
        queue.label(b, "kb", &versions("b")).await.unwrap();

        assert_eq!(queue.observe(["zz", "ka", "other"]).await, 1);
        assert!(!queue.contains(a));
        assert!(queue.contains(b));
    }

    #[tokio::test]
    async fn durable_records_follow_lifecycle() {
        let store = InMemoryLocalStore::new();
        let queue = OperationQueue::durable(Arc::new(store.clone()), "q");

        let a = queue.propose(set(&[("a", Some(json!(1)))])).await.unwrap();
        let _b = queue.propose(set(&[("b", Some(json!(2)))])).await.unwrap();
        assert_eq!(store.len(), 2);

        queue.label(a, "ka", &versions("a")).await.unwrap();
        queue.confirm("ka").await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn restore_reproduces_pending_state_in_order() {
        let store = InMemoryLocalStore::new();
        let before = OperationQueue::durable(Arc::new(store.clone()), "q");
        before.propose(set(&[("a", Some(json!(1)))])).await.unwrap();
        let labeled = before
            .propose(set(&[("a", Some(json!(2))), ("b", None)]))
            .await
            .unwrap();
        before.propose(set(&[("c", Some(json!(3)))])).await.unwrap();
        before.label(labeled, "k2", &versions("a")).await.unwrap();
        let expected = before.flatten();
        drop(before);

        let after = Arc::new(OperationQueue::durable(Arc::new(store.clone()), "q"));
        let mut seen = Vec::new();
        let replayed = after
            .restore(|op| {
                seen.push(op.label.clone());
                let after = Arc::clone(&after);
                async move {
                    let handle = after.propose(op.values).await?;
                    if let (Some(label), Some(versions)) = (op.label, op.versions) {
                        after.label(handle, &label, &versions).await?;
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(replayed, 3);
        assert_eq!(seen, vec![None, Some("k2".to_string()), None]);
        assert_eq!(after.flatten(), expected);
        // old records replaced by the replayed ones
        assert_eq!(store.len(), 3);

        // the restored label still confirms
        assert!(after.confirm("k2").await);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn restore_stops_at_failed_replay() {
        let store = InMemoryLocalStore::new();
        let before = OperationQueue::durable(Arc::new(store.clone()), "q");
        before.propose(set(&[("a", Some(json!(1)))])).await.unwrap();
        before.propose(set(&[("b", Some(json!(2)))])).await.unwrap();
        drop(before);

        let after = OperationQueue::durable(Arc::new(store.clone()), "q");
        let result = after
            .restore(|_| async { Err(EngineError::transport_retryable("down")) })
            .await;
        assert!(result.is_err());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn new_records_index_after_existing_ones() {
        let store = InMemoryLocalStore::new();
        let first = OperationQueue::durable(Arc::new(store.clone()), "q");
        first.propose(set(&[("a", Some(json!(1)))])).await.unwrap();
        drop(first);

        let second = OperationQueue::durable(Arc::new(store.clone()), "q");
        second.propose(set(&[("b", Some(json!(2)))])).await.unwrap();
        let keys = store.list_keys("q/op/").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
    }
}
