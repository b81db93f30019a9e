//! The manifest log entry wire format.
//!
//! Every log entry is a JSON document:
//!
//! ```json
//! {
//!   "update": { "files": { "bucket/key": { "version": "v1", "replication": null } } },
//!   "files": { "bucket/key": { "version": "v1", "replication": "AQ" } },
//!   "previous": "manifest.json@..."
//! }
//! ```
//!
//! `update` is a merge patch over `{"files": {...}}` and is always
//! present. `files` and `previous` appear together on compaction
//! snapshots only: `files` is the full state after folding every entry up
//! to and including `previous`.
//!
//! Nothing past [`ManifestFile::decode`] sees untyped JSON.

use crate::error::{ProtocolError, ProtocolResult};
use crate::merge::{diff, merge};
use crate::provenance::Provenance;
use crate::reference::ResolvedReference;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const FILES: &str = "files";
const UPDATE: &str = "update";
const PREVIOUS: &str = "previous";

/// The recorded state of one stored file.
///
/// `replication` always serializes, as `null` when empty, so that merging
/// a newer state over an older one drops stale provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileState {
    /// Content version: a `versionId` or a content hash.
    pub version: String,
    /// Replication sources this version already reflects.
    #[serde(default)]
    pub replication: Option<Provenance>,
}

impl FileState {
    /// Creates a state with no provenance.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            replication: None,
        }
    }

    /// Sets the provenance, treating an empty set as none.
    #[must_use]
    pub fn with_replication(mut self, replication: Provenance) -> Self {
        self.replication = (!replication.is_empty()).then_some(replication);
        self
    }

    /// Returns the provenance, empty if none was recorded.
    pub fn provenance(&self) -> Provenance {
        self.replication.clone().unwrap_or_default()
    }

    fn validate(&self, reference: &str) -> ProtocolResult<()> {
        if self.version.is_empty() {
            return Err(ProtocolError::invalid_manifest(format!(
                "empty version for {reference}"
            )));
        }
        Ok(())
    }
}

/// A typed manifest delta: each reference maps to its new state, or to
/// `None` for a deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestUpdate {
    files: BTreeMap<String, Option<FileState>>,
}

impl ManifestUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new state for `reference`.
    pub fn set(&mut self, reference: &ResolvedReference, state: FileState) {
        self.files.insert(reference.to_string(), Some(state));
    }

    /// Records a deletion of `reference`.
    pub fn delete(&mut self, reference: &ResolvedReference) {
        self.files.insert(reference.to_string(), None);
    }

    /// Returns true if the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of references touched.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Iterates over touched references in order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, Option<&FileState>)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Converts to the merge patch stored on the wire.
    pub fn to_value(&self) -> Value {
        let files: Map<String, Value> = self
            .files
            .iter()
            .map(|(reference, state)| {
                let value = match state {
                    Some(state) => serde_json::to_value(state).unwrap_or(Value::Null),
                    None => Value::Null,
                };
                (reference.clone(), value)
            })
            .collect();
        let mut root = Map::new();
        if !files.is_empty() {
            root.insert(FILES.to_string(), Value::Object(files));
        }
        Value::Object(root)
    }

    /// Validates a wire patch.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidManifest`] unless the patch is an
    /// object whose optional `files` member maps `bucket/key` strings to a
    /// file state or `null`.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let Value::Object(root) = value else {
            return Err(ProtocolError::invalid_manifest("update is not an object"));
        };
        if let Some(extra) = root.keys().find(|k| k.as_str() != FILES) {
            return Err(ProtocolError::invalid_manifest(format!(
                "unknown update member {extra:?}"
            )));
        }

        let mut update = Self::new();
        match root.get(FILES) {
            None | Some(Value::Null) => {}
            Some(Value::Object(files)) => {
                for (reference, state) in files {
                    ResolvedReference::parse(reference).map_err(|_| {
                        ProtocolError::invalid_manifest(format!("bad reference {reference:?}"))
                    })?;
                    let state = match state {
                        Value::Null => None,
                        other => {
                            let state: FileState = serde_json::from_value(other.clone())
                                .map_err(|e| {
                                    ProtocolError::invalid_manifest(format!(
                                        "bad file state for {reference}: {e}"
                                    ))
                                })?;
                            state.validate(reference)?;
                            Some(state)
                        }
                    };
                    update.files.insert(reference.clone(), state);
                }
            }
            Some(_) => {
                return Err(ProtocolError::invalid_manifest("update.files is not an object"))
            }
        }
        Ok(update)
    }
}

/// The folded key to version mapping of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestState {
    files: BTreeMap<String, FileState>,
}

impl ManifestState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the state of a reference.
    pub fn get(&self, reference: &ResolvedReference) -> Option<&FileState> {
        self.files.get(&reference.to_string())
    }

    /// Returns all live files, keyed by `bucket/key`.
    pub fn files(&self) -> &BTreeMap<String, FileState> {
        &self.files
    }

    /// Number of live files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if no file is live.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Applies a delta through merge patch.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged document is not a valid state.
    pub fn apply(&mut self, update: &ManifestUpdate) -> ProtocolResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let merged = merge(&self.to_document(), Some(&update.to_value()));
        *self = Self::from_document(&merged)?;
        Ok(())
    }

    /// Returns the update that turns `self` into `after`.
    ///
    /// Changed files are carried whole, never as partial patches.
    pub fn changes_to(&self, after: &ManifestState) -> ManifestUpdate {
        let mut update = ManifestUpdate::new();
        let Some(Value::Object(patch)) = diff(&self.to_document(), &after.to_document()) else {
            return update;
        };
        let Some(Value::Object(files)) = patch.get(FILES) else {
            return update;
        };
        for reference in files.keys() {
            update
                .files
                .insert(reference.clone(), after.files.get(reference).cloned());
        }
        update
    }

    /// Converts to the `{"files": {...}}` document patches apply to.
    pub fn to_document(&self) -> Value {
        let files: Map<String, Value> = self
            .files
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(Value::Null)))
            .collect();
        let mut root = Map::new();
        root.insert(FILES.to_string(), Value::Object(files));
        Value::Object(root)
    }

    /// Reads a `{"files": {...}}` document.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidManifest`] on any other shape.
    pub fn from_document(document: &Value) -> ProtocolResult<Self> {
        let update = ManifestUpdate::from_value(document)?;
        let files = update
            .files
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();
        Ok(Self { files })
    }
}

impl From<BTreeMap<String, FileState>> for ManifestState {
    fn from(files: BTreeMap<String, FileState>) -> Self {
        Self { files }
    }
}

/// One manifest log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestFile {
    /// Full state, on snapshots only.
    pub files: Option<ManifestState>,
    /// Delta relative to the previous entry.
    pub update: ManifestUpdate,
    /// Newest log key folded into `files`, on snapshots only.
    pub previous: Option<String>,
}

impl ManifestFile {
    /// Creates a delta entry.
    pub fn delta(update: ManifestUpdate) -> Self {
        Self {
            files: None,
            update,
            previous: None,
        }
    }

    /// Creates a snapshot entry covering every entry up to `previous`.
    pub fn snapshot(files: ManifestState, previous: impl Into<String>) -> Self {
        Self {
            files: Some(files),
            update: ManifestUpdate::new(),
            previous: Some(previous.into()),
        }
    }

    /// Returns true for compaction snapshots.
    pub fn is_snapshot(&self) -> bool {
        self.files.is_some()
    }

    /// Serializes to JSON bytes.
    pub fn encode(&self) -> Vec<u8> {
        // a Value always serializes
        serde_json::to_vec(&self.to_value()).unwrap_or_default()
    }

    /// Converts to the wire document.
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        if let Some(files) = &self.files {
            if let Some(doc) = files.to_document().get(FILES) {
                root.insert(FILES.to_string(), doc.clone());
            }
        }
        root.insert(UPDATE.to_string(), self.update.to_value());
        if let Some(previous) = &self.previous {
            root.insert(PREVIOUS.to_string(), Value::String(previous.clone()));
        }
        Value::Object(root)
    }

    /// Decodes and validates JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidManifest`] if the bytes are not a
    /// well-formed log entry.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::invalid_manifest(format!("not json: {e}")))?;
        Self::from_value(&value)
    }

    /// Validates an already parsed document.
    ///
    /// # Errors
    ///
    /// Same as [`ManifestFile::decode`].
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let Value::Object(root) = value else {
            return Err(ProtocolError::invalid_manifest("entry is not an object"));
        };
        if let Some(extra) = root
            .keys()
            .find(|k| ![FILES, UPDATE, PREVIOUS].contains(&k.as_str()))
        {
            return Err(ProtocolError::invalid_manifest(format!(
                "unknown member {extra:?}"
            )));
        }

        let update = match root.get(UPDATE) {
            Some(update) => ManifestUpdate::from_value(update)?,
            None => return Err(ProtocolError::invalid_manifest("missing update")),
        };

        let files = match root.get(FILES) {
            None | Some(Value::Null) => None,
            Some(files) => {
                let mut doc = Map::new();
                doc.insert(FILES.to_string(), files.clone());
                Some(ManifestState::from_document(&Value::Object(doc))?)
            }
        };

        let previous = match root.get(PREVIOUS) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(_) => return Err(ProtocolError::invalid_manifest("previous is not a key")),
        };

        if files.is_some() != previous.is_some() {
            return Err(ProtocolError::invalid_manifest(
                "files and previous must appear together",
            ));
        }

        Ok(Self {
            files,
            update,
            previous,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn r(key: &str) -> ResolvedReference {
        ResolvedReference::new("b", key)
    }

    #[test]
    fn file_state_serializes_null_replication() {
        let json = serde_json::to_value(FileState::new("v1")).unwrap();
        assert_eq!(json, json!({"version": "v1", "replication": null}));

        let back: FileState = serde_json::from_value(json!({"version": "v1"})).unwrap();
        assert_eq!(back, FileState::new("v1"));
    }

    #[test]
    fn empty_provenance_is_none() {
        let state = FileState::new("v").with_replication(Provenance::new());
        assert_eq!(state.replication, None);
        assert!(state.provenance().is_empty());
    }

    #[test]
    fn update_wire_shape() {
        let mut update = ManifestUpdate::new();
        update.set(&r("a"), FileState::new("1"));
        update.delete(&r("gone"));
        assert_eq!(
            update.to_value(),
            json!({"files": {"b/a": {"version": "1", "replication": null}, "b/gone": null}})
        );
        assert_eq!(ManifestUpdate::from_value(&update.to_value()).unwrap(), update);
        assert_eq!(ManifestUpdate::new().to_value(), json!({}));
    }

    #[test]
    fn apply_sets_and_deletes() {
        let mut state = ManifestState::new();
        let mut first = ManifestUpdate::new();
        first.set(
            &r("a"),
            FileState::new("1").with_replication(Provenance::with_bit(2)),
        );
        first.set(&r("b"), FileState::new("1"));
        state.apply(&first).unwrap();
        assert_eq!(state.len(), 2);

        let mut second = ManifestUpdate::new();
        second.set(&r("a"), FileState::new("2"));
        second.delete(&r("b"));
        state.apply(&second).unwrap();

        assert_eq!(state.get(&r("a")), Some(&FileState::new("2")));
        assert_eq!(state.get(&r("b")), None);
    }

    #[test]
    fn changes_to_carries_whole_states() {
        let mut before = ManifestState::new();
        let mut seed = ManifestUpdate::new();
        seed.set(
            &r("keep"),
            FileState::new("1").with_replication(Provenance::with_bit(0)),
        );
        seed.set(&r("drop"), FileState::new("1"));
        before.apply(&seed).unwrap();

        let mut after = before.clone();
        let mut change = ManifestUpdate::new();
        change.set(
            &r("keep"),
            FileState::new("2").with_replication(Provenance::with_bit(0)),
        );
        change.delete(&r("drop"));
        change.set(&r("new"), FileState::new("9"));
        after.apply(&change).unwrap();

        let update = before.changes_to(&after);
        assert_eq!(update, change);

        let mut replayed = before.clone();
        replayed.apply(&update).unwrap();
        assert_eq!(replayed, after);
        assert!(after.changes_to(&after).is_empty());
    }

    #[test]
    fn delta_and_snapshot_roundtrip() {
        let mut update = ManifestUpdate::new();
        update.set(&r("a"), FileState::new("x"));
        let delta = ManifestFile::delta(update.clone());
        assert!(!delta.is_snapshot());
        assert_eq!(ManifestFile::decode(&delta.encode()).unwrap(), delta);

        let mut state = ManifestState::new();
        state.apply(&update).unwrap();
        let snapshot = ManifestFile::snapshot(state, "m@key");
        assert!(snapshot.is_snapshot());
        assert_eq!(ManifestFile::decode(&snapshot.encode()).unwrap(), snapshot);
    }

    #[test]
    fn decode_rejects_malformed_entries() {
        let bad = [
            json!([]),
            json!({}),
            json!({"update": []}),
            json!({"update": {"files": []}}),
            json!({"update": {"files": {"nobucket": null}}}),
            json!({"update": {"files": {"b/k": {"version": 1}}}}),
            json!({"update": {"files": {"b/k": {"version": ""}}}}),
            json!({"update": {"files": {"b/k": {"version": "1", "extra": true}}}}),
            json!({"update": {}, "files": {}}),
            json!({"update": {}, "previous": "m@k"}),
            json!({"update": {}, "bogus": 1}),
        ];
        for doc in bad {
            let bytes = serde_json::to_vec(&doc).unwrap();
            assert!(
                matches!(ManifestFile::decode(&bytes), Err(ProtocolError::InvalidManifest(_))),
                "accepted {doc}"
            );
        }
        assert!(ManifestFile::decode(b"not json").is_err());
    }
}
