//! Client facade over one object store.

use crate::clock::ClockContext;
use crate::config::{ClientConfig, Durability};
use crate::content::ContentStore;
use crate::error::{EngineError, EngineResult};
use crate::manifest::{Manifest, Notification, SubscriptionId};
use crate::queue::{OperationHandle, ValueSet};
use bucketlog_protocol::{Reference, ResolvedReference};
use bucketlog_storage::{LocalStore, ObjectStore};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const QUEUE_PREFIX: &str = "queue/";
const RECORDS_SEPARATOR: &str = "/op/";

/// An eventually consistent key-value client.
///
/// Values live in the bucket as ordinary objects; which version of each is
/// current is decided by a manifest log. Every client sharing a bucket and
/// manifest key converges on the same state.
///
/// # Example
///
/// ```rust,no_run
/// use bucketlog_engine::{Client, ClientConfig};
/// use bucketlog_storage::InMemoryObjectStore;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> bucketlog_engine::EngineResult<()> {
/// let store = Arc::new(InMemoryObjectStore::new());
/// let client = Client::new(ClientConfig::new("photos"), store);
///
/// client.put("albums/summer", json!({"count": 12})).await?;
/// assert_eq!(client.get("albums/summer").await?, Some(json!({"count": 12})));
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    store: Arc<dyn ObjectStore>,
    local: Option<Arc<dyn LocalStore>>,
    clock: Arc<ClockContext>,
    online: Arc<AtomicBool>,
    content: Arc<ContentStore>,
    manifests: Mutex<HashMap<ResolvedReference, Manifest>>,
}

impl Client {
    /// Creates a client.
    pub fn new(config: ClientConfig, store: Arc<dyn ObjectStore>) -> Self {
        let content = Arc::new(ContentStore::new(Arc::clone(&store), config.use_versioning));
        Self {
            online: Arc::new(AtomicBool::new(config.online)),
            config,
            store,
            local: None,
            clock: Arc::new(ClockContext::new()),
            content,
            manifests: Mutex::new(HashMap::new()),
        }
    }

    /// Persists pending operations and folded state in `local`.
    ///
    /// Must be set before the first manifest is opened.
    pub fn with_local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    /// Uses `clock` instead of a fresh one, e.g. to share or skew it.
    pub fn with_clock(mut self, clock: Arc<ClockContext>) -> Self {
        self.clock = clock;
        self
    }

    /// The client's configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The clock used for log keys.
    pub fn clock(&self) -> &Arc<ClockContext> {
        &self.clock
    }

    /// Resolves a reference against the default bucket.
    pub fn resolve(&self, reference: impl Into<Reference>) -> ResolvedReference {
        reference.into().resolve(&self.config.bucket)
    }

    /// The default manifest.
    pub fn manifest(&self) -> Manifest {
        self.manifest_at(ResolvedReference::new(
            self.config.bucket.clone(),
            self.config.manifest_key.clone(),
        ))
    }

    /// The manifest stored at `reference`, opened on first use.
    pub fn manifest_at(&self, reference: impl Into<Reference>) -> Manifest {
        let reference = self.resolve(reference);
        self.manifests
            .lock()
            .entry(reference.clone())
            .or_insert_with(|| {
                debug!(manifest = %reference, "opening manifest");
                Manifest::open(
                    reference,
                    Arc::clone(&self.store),
                    self.local.clone(),
                    Arc::clone(&self.content),
                    Arc::clone(&self.clock),
                    Arc::clone(&self.online),
                    &self.config,
                )
            })
            .clone()
    }

    /// Reads a value through the default manifest.
    ///
    /// # Errors
    ///
    /// Returns any fold or download error.
    pub async fn get(&self, reference: impl Into<Reference>) -> EngineResult<Option<Value>> {
        let reference = self.resolve(reference);
        self.manifest().get(&reference).await
    }

    /// Writes a value and waits for its log entry. `null` deletes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Offline`] while offline, or any write error.
    pub async fn put(&self, reference: impl Into<Reference>, value: Value) -> EngineResult<()> {
        self.put_with(reference, value, Durability::Remote)
            .await
            .map(|_| ())
    }

    /// Writes a value with the given durability. `null` deletes.
    ///
    /// # Errors
    ///
    /// Same as [`Manifest::update_content`].
    pub async fn put_with(
        &self,
        reference: impl Into<Reference>,
        value: Value,
        durability: Durability,
    ) -> EngineResult<OperationHandle> {
        let reference: Reference = reference.into();
        self.write([(reference, Some(value))], durability).await
    }

    /// Deletes a value and waits for its log entry.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Offline`] while offline, or any write error.
    pub async fn delete(&self, reference: impl Into<Reference>) -> EngineResult<()> {
        let reference: Reference = reference.into();
        self.write([(reference, None)], Durability::Remote)
            .await
            .map(|_| ())
    }

    /// Writes several values as one atomic log entry.
    ///
    /// # Errors
    ///
    /// Same as [`Manifest::update_content`].
    pub async fn write<I>(&self, values: I, durability: Durability) -> EngineResult<OperationHandle>
    where
        I: IntoIterator<Item = (Reference, Option<Value>)>,
    {
        let values: ValueSet = values
            .into_iter()
            .map(|(reference, value)| {
                let value = value.filter(|v| !v.is_null());
                (self.resolve(reference), value)
            })
            .collect();
        if values.is_empty() {
            return Err(EngineError::EmptyWrite);
        }
        self.manifest().update_content(values, durability).await
    }

    /// Watches a value of the default manifest.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn subscribe<F>(&self, reference: impl Into<Reference>, handler: F) -> SubscriptionId
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let reference = self.resolve(reference);
        self.manifest().subscribe(reference, handler)
    }

    /// Stops a subscription made with [`Client::subscribe`].
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.manifest().unsubscribe(id)
    }

    /// Returns true if the client talks to the object store.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Switches between online and offline.
    ///
    /// Going online commits every write deferred while offline and returns
    /// how many were committed.
    ///
    /// # Errors
    ///
    /// Returns the first failed deferred write.
    pub async fn set_online(&self, online: bool) -> EngineResult<usize> {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return Ok(0);
        }
        info!(bucket = %self.config.bucket, online, "connectivity changed");
        if !online {
            return Ok(0);
        }

        let manifests: Vec<Manifest> = self.manifests.lock().values().cloned().collect();
        let mut flushed = 0;
        for manifest in manifests {
            flushed += manifest.flush().await?;
        }
        Ok(flushed)
    }

    /// Resumes operations persisted in the local store by an earlier
    /// session, for every manifest that has any.
    ///
    /// # Errors
    ///
    /// Returns the first error from the local store or a replay.
    pub async fn restore(&self) -> EngineResult<usize> {
        let Some(local) = &self.local else {
            return Ok(0);
        };
        let keys = local.list_keys(QUEUE_PREFIX).await?;
        let manifests: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(QUEUE_PREFIX))
            .filter_map(|key| key.rsplit_once(RECORDS_SEPARATOR))
            .map(|(manifest, _)| manifest.to_string())
            .collect();

        let mut restored = 0;
        for manifest in manifests {
            let reference = match ResolvedReference::parse(&manifest) {
                Ok(reference) => reference,
                Err(e) => {
                    warn!(%manifest, error = %e, "skipping records of unparseable manifest");
                    continue;
                }
            };
            restored += self.manifest_at(reference).restore().await?;
        }
        if restored > 0 {
            info!(restored, "restored pending operations");
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketlog_storage::{InMemoryLocalStore, InMemoryObjectStore};
    use serde_json::json;

    fn client(store: &Arc<InMemoryObjectStore>) -> Client {
        Client::new(ClientConfig::new("b"), store.clone())
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = Arc::new(InMemoryObjectStore::new());
        let c = client(&store);

        assert_eq!(c.get("k").await.unwrap(), None);
        c.put("k", json!([1, 2])).await.unwrap();
        assert_eq!(c.get("k").await.unwrap(), Some(json!([1, 2])));
        c.delete("k").await.unwrap();
        assert_eq!(c.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn null_put_deletes() {
        let store = Arc::new(InMemoryObjectStore::new());
        let c = client(&store);
        c.put("k", json!(1)).await.unwrap();
        c.put("k", Value::Null).await.unwrap();
        assert_eq!(client(&store).get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn references_resolve_against_default_bucket() {
        let store = Arc::new(InMemoryObjectStore::new());
        let c = client(&store);
        assert_eq!(c.resolve("k"), ResolvedReference::new("b", "k"));
        assert_eq!(
            c.resolve(Reference::in_bucket("other", "k")),
            ResolvedReference::new("other", "k")
        );

        c.put(Reference::in_bucket("other", "k"), json!("x")).await.unwrap();
        assert_eq!(store.keys("other"), vec!["k".to_string()]);
        assert_eq!(
            c.get(Reference::in_bucket("other", "k")).await.unwrap(),
            Some(json!("x"))
        );
        assert_eq!(c.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn manifests_are_shared_per_reference() {
        let store = Arc::new(InMemoryObjectStore::new());
        let c = client(&store);
        c.manifest()
            .update_content(
                [(c.resolve("k"), Some(json!(1)))].into_iter().collect(),
                Durability::Local,
            )
            .await
            .unwrap();
        assert_eq!(c.manifest().queue().len(), 1);
        assert_eq!(c.manifest_at("other.json").queue().len(), 0);
    }

    #[tokio::test]
    async fn empty_write_is_rejected() {
        let store = Arc::new(InMemoryObjectStore::new());
        let err = client(&store)
            .write(Vec::<(Reference, Option<Value>)>::new(), Durability::Remote)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyWrite));
    }

    #[tokio::test]
    async fn going_online_flushes_deferred_writes() {
        let store = Arc::new(InMemoryObjectStore::new());
        let c = Client::new(ClientConfig::new("b").with_online(false), store.clone());

        assert!(matches!(
            c.put("k", json!(1)).await,
            Err(EngineError::Offline)
        ));
        c.put_with("k", json!(2), Durability::Local).await.unwrap();
        assert_eq!(c.get("k").await.unwrap(), Some(json!(2)));

        assert_eq!(c.set_online(true).await.unwrap(), 1);
        assert_eq!(c.set_online(true).await.unwrap(), 0);
        assert_eq!(client(&store).get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn restore_finds_every_manifest() {
        let store = Arc::new(InMemoryObjectStore::new());
        let local: Arc<dyn LocalStore> = Arc::new(InMemoryLocalStore::new());
        let offline = ClientConfig::new("b").with_online(false);

        {
            let c = Client::new(offline, store.clone()).with_local_store(Arc::clone(&local));
            c.put_with("k", json!(1), Durability::Local).await.unwrap();
            c.manifest_at("other.json")
                .update_content(
                    [(c.resolve("j"), Some(json!(2)))].into_iter().collect(),
                    Durability::Local,
                )
                .await
                .unwrap();
        }

        let c = Client::new(ClientConfig::new("b"), store.clone()).with_local_store(local);
        assert_eq!(c.restore().await.unwrap(), 2);
        assert_eq!(c.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(
            c.manifest_at("other.json").get(&c.resolve("j")).await.unwrap(),
            Some(json!(2))
        );
    }
}
