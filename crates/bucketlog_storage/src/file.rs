//! File-based local store for persistent storage.

use crate::error::{StorageError, StorageResult};
use crate::local::LocalStore;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const TEMP_SUFFIX: &str = ".tmp";

/// A directory-backed local store.
///
/// Each key is stored in its own file. File names are the hex encoding of
/// the key bytes, which keeps the on-disk order identical to the key
/// order and keeps arbitrary key characters out of the file system.
///
/// # Durability
///
/// - `set` writes a temporary file, syncs it, then renames it over the
///   target, so a crash leaves either the old or the new value
/// - `delete` of a missing key succeeds
///
/// # Example
///
/// ```no_run
/// use bucketlog_storage::{FileLocalStore, LocalStore};
/// use std::path::Path;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = FileLocalStore::open(Path::new("state")).await.unwrap();
/// store.set("queue/0001", b"pending".to_vec()).await.unwrap();
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    dir: PathBuf,
}

impl FileLocalStore {
    /// Opens or creates a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: &Path) -> StorageResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Returns the directory backing this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_name(key))
    }
}

fn encode_name(key: &str) -> String {
    key.bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode_name(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.file_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let target = self.file_for(key);
        let temp = self.dir.join(format!("{}{TEMP_SUFFIX}", encode_name(key)));

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &target).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.file_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            match decode_name(name) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => {
                    return Err(StorageError::Corrupted(format!(
                        "unexpected file in local store: {name}"
                    )))
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
