//! Durable local key/value store trait.

use crate::error::StorageResult;
use async_trait::async_trait;

/// A small durable key/value store on the local device.
///
/// Used by the engine to survive restarts: pending writes are recorded
/// here before they are visible to readers, and the last folded manifest
/// state is cached here for offline reads.
///
/// # Invariants
///
/// - `set` is durable once it returns
/// - `list_keys` returns keys in ascending lexicographic order
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Reads a value.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Writes a value, replacing any previous one.
    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Removes a value. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists all keys starting with `prefix`, ascending.
    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}
