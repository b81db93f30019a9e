//! Upload and download of stored values.
//!
//! With bucket versioning, a value lives at its own key and its version
//! is the store's `versionId`. Without it, every value is written to
//! `<key>@<content hash>` and the hash is the version, which keeps old
//! versions readable for as long as a manifest points at them.

use crate::error::{EngineError, EngineResult};
use bucketlog_protocol::{content_hash, ResolvedReference};
use bucketlog_storage::{GetOptions, GetStatus, ObjectStore};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const CACHE_LIMIT: usize = 1024;
const CONTENT_TYPE: &str = "application/json";

/// Reads and writes value content for a client.
pub struct ContentStore {
    store: Arc<dyn ObjectStore>,
    use_versioning: bool,
    /// Versions are immutable, so entries never go stale.
    cache: Mutex<HashMap<(ResolvedReference, String), Value>>,
}

impl ContentStore {
    /// Creates a content store.
    pub fn new(store: Arc<dyn ObjectStore>, use_versioning: bool) -> Self {
        Self {
            store,
            use_versioning,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if content is addressed by version ids.
    pub fn use_versioning(&self) -> bool {
        self.use_versioning
    }

    /// Key a version is stored under.
    pub fn object_key(&self, reference: &ResolvedReference, version: &str) -> String {
        if self.use_versioning {
            reference.key.clone()
        } else {
            format!("{}@{}", reference.key, version)
        }
    }

    /// Uploads a value and returns its version.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::VersioningRequired`] if versioning is on and
    /// the store returned no version id, or any store error.
    pub async fn upload(&self, reference: &ResolvedReference, value: &Value) -> EngineResult<String> {
        let body = serde_json::to_vec(value)?;
        let version = if self.use_versioning {
            let out = self
                .store
                .put(&reference.bucket, &reference.key, Bytes::from(body), Some(CONTENT_TYPE))
                .await?;
            match out.version_id {
                Some(version) if !version.is_empty() => version,
                _ => {
                    return Err(EngineError::VersioningRequired {
                        reference: reference.to_string(),
                    })
                }
            }
        } else {
            let hash = content_hash(&body);
            let key = self.object_key(reference, &hash);
            self.store
                .put(&reference.bucket, &key, Bytes::from(body), Some(CONTENT_TYPE))
                .await?;
            hash
        };

        debug!(%reference, %version, "uploaded content");
        self.remember(reference, &version, value.clone());
        Ok(version)
    }

    /// Downloads one version of a value; `None` if it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the content is not JSON.
    pub async fn download(
        &self,
        reference: &ResolvedReference,
        version: &str,
    ) -> EngineResult<Option<Value>> {
        let cache_key = (reference.clone(), version.to_string());
        if let Some(value) = self.cache.lock().get(&cache_key) {
            return Ok(Some(value.clone()));
        }

        let options = if self.use_versioning {
            GetOptions::version(version)
        } else {
            GetOptions::default()
        };
        let out = self
            .store
            .get(&reference.bucket, &self.object_key(reference, version), options)
            .await?;
        let body = match (out.status, out.body) {
            (GetStatus::Ok, Some(body)) => body,
            _ => return Ok(None),
        };

        let value: Value = serde_json::from_slice(&body)?;
        self.remember(reference, version, value.clone());
        Ok(Some(value))
    }

    fn remember(&self, reference: &ResolvedReference, version: &str, value: Value) {
        let mut cache = self.cache.lock();
        if cache.len() >= CACHE_LIMIT {
            cache.clear();
        }
        cache.insert((reference.clone(), version.to_string()), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketlog_storage::InMemoryObjectStore;
    use serde_json::json;

    #[tokio::test]
    async fn versioned_upload_uses_version_ids() {
        let store = Arc::new(InMemoryObjectStore::new());
        let content = ContentStore::new(store.clone(), true);
        let r = ResolvedReference::new("b", "doc");

        let v1 = content.upload(&r, &json!({"n": 1})).await.unwrap();
        let v2 = content.upload(&r, &json!({"n": 2})).await.unwrap();
        assert_ne!(v1, v2);
        assert_eq!(store.keys("b"), vec!["doc".to_string()]);

        let fresh = ContentStore::new(store, true);
        assert_eq!(fresh.download(&r, &v1).await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(fresh.download(&r, &v2).await.unwrap(), Some(json!({"n": 2})));
    }

    #[tokio::test]
    async fn unversioned_bucket_requires_versioning_off() {
        let store = Arc::new(InMemoryObjectStore::with_versioning(false));
        let content = ContentStore::new(store, true);
        let err = content
            .upload(&ResolvedReference::new("b", "doc"), &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::VersioningRequired { .. }));
    }

    #[tokio::test]
    async fn hash_addressed_content() {
        let store = Arc::new(InMemoryObjectStore::with_versioning(false));
        let content = ContentStore::new(store.clone(), false);
        let r = ResolvedReference::new("b", "doc");

        let v = content.upload(&r, &json!("hello")).await.unwrap();
        assert_eq!(v, content_hash(b"\"hello\""));
        assert_eq!(store.keys("b"), vec![format!("doc@{v}")]);

        let fresh = ContentStore::new(store, false);
        assert_eq!(fresh.download(&r, &v).await.unwrap(), Some(json!("hello")));
        assert_eq!(fresh.download(&r, "missing").await.unwrap(), None);
    }
}
