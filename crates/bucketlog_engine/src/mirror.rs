//! One-way replication between manifests, usable in both directions.
//!
//! A run reads the source log since the last checkpoint and commits the
//! combined changes to the target as a single entry. The updated
//! checkpoint rides in the same entry, stored as an ordinary value under
//! `.mirror/<source manifest>` in the target's bucket.
//!
//! Once the source compacts, the entries a run would read may already be
//! collected. A run that finds a snapshot standing in for part of its
//! window compares full states instead.
//!
//! Every replicated file carries the union of its source provenance and
//! the target's replication bit. A file whose provenance already holds
//! the target's bit came from the target and is skipped, which stops two
//! mirrors running in opposite directions from copying forever.

use crate::config::Durability;
use crate::error::{EngineError, EngineResult};
use crate::manifest::{Manifest, ProvenanceMap};
use crate::queue::ValueSet;
use crate::syncer::LogEntry;
use bucketlog_protocol::{
    compose, LogKey, ManifestState, ManifestUpdate, Provenance, ResolvedReference,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Key prefix of checkpoint values; never replicated.
pub const MIRROR_PREFIX: &str = ".mirror/";

/// How far behind the newest replicated entry a run looks again.
pub const DEFAULT_LAG: Duration = Duration::from_secs(30);

/// Progress of one replication direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Newest source timestamp replicated, in milliseconds.
    pub mark: u64,
    /// Source log keys within the lag window that were already replicated.
    #[serde(default)]
    pub operations: BTreeSet<String>,
}

/// Outcome of one replication run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Source log entries read.
    pub scanned: usize,
    /// Values copied to the target.
    pub copied: usize,
    /// Deletions applied to the target.
    pub deleted: usize,
    /// Changes skipped because the target already had them.
    pub skipped: usize,
    /// Whether anything, checkpoint included, was written to the target.
    pub committed: bool,
}

/// Where the checkpoint for `source -> target` is stored.
pub fn checkpoint_reference(target: &Manifest, source: &Manifest) -> ResolvedReference {
    ResolvedReference::new(
        target.reference().bucket.clone(),
        format!("{MIRROR_PREFIX}{}", source.reference()),
    )
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn is_checkpoint(reference: &ResolvedReference) -> bool {
    reference.key.starts_with(MIRROR_PREFIX)
}

/// True for entries that only move checkpoints; they never advance a mark.
fn checkpoint_only(update: &ManifestUpdate) -> bool {
    update.entries().all(|(reference, _)| {
        ResolvedReference::parse(reference).map_or(false, |r| is_checkpoint(&r))
    })
}

/// True if `entry` is a snapshot folding in entries newer than `after`,
/// which may be gone from the log.
fn covers_window(manifest_key: &str, entry: &LogEntry, after: u64) -> bool {
    entry.file.previous.as_deref().is_some_and(|previous| {
        LogKey::parse(manifest_key, previous).map_or(true, |key| key.timestamp > after)
    })
}

/// Reads the checkpoint for `source -> target` from the target.
///
/// # Errors
///
/// Returns any read error, or a decode error for a malformed checkpoint.
pub async fn load_checkpoint(target: &Manifest, source: &Manifest) -> EngineResult<Checkpoint> {
    match target.get(&checkpoint_reference(target, source)).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(Checkpoint::default()),
    }
}

/// Copies the changes `source` made since `checkpoint` into `target`.
///
/// A zero mark copies the whole current state of the source, without
/// deletions. Otherwise every source entry newer than `mark - lag` and not
/// listed in the checkpoint is combined, oldest first, and applied. If a
/// snapshot has replaced part of that window, the source state is compared
/// with the target instead: values that differ are copied, and files that
/// came from the source but are gone there are deleted.
/// References in the source manifest's bucket map to the target
/// manifest's bucket; other buckets are kept.
///
/// The target is written only if there is something to copy or the
/// checkpoint moved. Returns the report and the checkpoint now in effect.
///
/// # Errors
///
/// Returns [`EngineError::InvalidConfig`] if the target client has no
/// replication id, or any read or write error.
pub async fn replicate(
    target: &Manifest,
    source: &Manifest,
    checkpoint: &Checkpoint,
    lag: Duration,
) -> EngineResult<(ReplicationReport, Checkpoint)> {
    let target_bit = target.replication_id().ok_or_else(|| {
        EngineError::InvalidConfig(format!(
            "replicating into {} requires a replication id",
            target.reference()
        ))
    })?;
    let target_bits = Provenance::with_bit(target_bit);
    let lag_ms = millis(lag);
    let mut report = ReplicationReport::default();

    let target_state = target.state().await?;
    let (changes, next, rebased) = if checkpoint.mark == 0 {
        let (changes, next) = full_sync(source, lag_ms, &mut report).await?;
        (changes, next, false)
    } else if let Some((changes, next)) =
        incremental(source, checkpoint, lag_ms, &mut report).await?
    {
        (changes, next, false)
    } else {
        info!(
            source = %source.reference(),
            target = %target.reference(),
            mark = checkpoint.mark,
            "source log compacted past the checkpoint, comparing full state"
        );
        let (changes, next) = rebase(target, source, &target_state, lag_ms, &mut report).await?;
        (changes, next, true)
    };

    let mut values = ValueSet::new();
    let mut provenance = ProvenanceMap::new();
    for (reference, file) in changes.entries() {
        let from = ResolvedReference::parse(reference)?;
        if is_checkpoint(&from) {
            continue;
        }
        let to = if from.bucket == source.reference().bucket {
            from.with_bucket(&target.reference().bucket)
        } else {
            from.clone()
        };

        match file {
            Some(file) => {
                let bits = file.provenance();
                if target_bits.inside(&bits) {
                    report.skipped += 1;
                    continue;
                }
                let Some(value) = source.content().download(&from, &file.version).await? else {
                    warn!(reference = %from, version = %file.version, "source content missing, skipping");
                    report.skipped += 1;
                    continue;
                };
                if rebased {
                    if let Some(current) = target_state.get(&to) {
                        let held = target.content().download(&to, &current.version).await?;
                        if held.as_ref() == Some(&value) {
                            report.skipped += 1;
                            continue;
                        }
                    }
                }
                provenance.insert(to.clone(), bits.union(&target_bits));
                values.insert(to, Some(value));
                report.copied += 1;
            }
            None => {
                if target_state.get(&to).is_none() {
                    report.skipped += 1;
                    continue;
                }
                values.insert(to, None);
                report.deleted += 1;
            }
        }
    }

    if values.is_empty() && next == *checkpoint {
        debug!(source = %source.reference(), target = %target.reference(), "nothing to replicate");
        return Ok((report, next));
    }

    values.insert(
        checkpoint_reference(target, source),
        Some(serde_json::to_value(&next)?),
    );
    target
        .update_with_provenance(values, provenance, Durability::Remote)
        .await?;
    report.committed = true;

    info!(
        source = %source.reference(),
        target = %target.reference(),
        scanned = report.scanned,
        copied = report.copied,
        deleted = report.deleted,
        skipped = report.skipped,
        mark = next.mark,
        "replicated"
    );
    Ok((report, next))
}

async fn full_sync(
    source: &Manifest,
    lag_ms: u64,
    report: &mut ReplicationReport,
) -> EngineResult<(ManifestUpdate, Checkpoint)> {
    let state = source.state().await?;
    let keys: Vec<LogKey> = source
        .listed_keys()
        .iter()
        .filter_map(|k| LogKey::parse(&source.reference().key, k).ok())
        .collect();
    let mark = keys.first().map_or(0, |k| k.timestamp);
    let operations = keys
        .iter()
        .filter(|k| k.timestamp > mark.saturating_sub(lag_ms))
        .map(ToString::to_string)
        .collect();
    report.scanned = keys.len();

    let mut changes = ManifestUpdate::new();
    for (reference, file) in state.files() {
        let reference = ResolvedReference::parse(reference)?;
        changes.set(&reference, file.clone());
    }
    Ok((changes, Checkpoint { mark, operations }))
}

/// Full source state plus deletions for target files that came from the
/// source and are no longer there.
async fn rebase(
    target: &Manifest,
    source: &Manifest,
    target_state: &ManifestState,
    lag_ms: u64,
    report: &mut ReplicationReport,
) -> EngineResult<(ManifestUpdate, Checkpoint)> {
    let (mut changes, next) = full_sync(source, lag_ms, report).await?;
    let Some(source_bit) = source.replication_id() else {
        debug!(source = %source.reference(), "source has no replication id, not deleting");
        return Ok((changes, next));
    };
    let source_bits = Provenance::with_bit(source_bit);
    let source_state = source.cached_state();
    for (reference, file) in target_state.files() {
        let to = ResolvedReference::parse(reference)?;
        if is_checkpoint(&to) || !source_bits.inside(&file.provenance()) {
            continue;
        }
        let from = if to.bucket == target.reference().bucket {
            to.with_bucket(&source.reference().bucket)
        } else {
            to
        };
        if source_state.get(&from).is_none() {
            changes.delete(&from);
        }
    }
    Ok((changes, next))
}

/// Combines the source entries since the checkpoint. `None` means part of
/// the window was compacted into a snapshot the checkpoint does not know.
async fn incremental(
    source: &Manifest,
    checkpoint: &Checkpoint,
    lag_ms: u64,
    report: &mut ReplicationReport,
) -> EngineResult<Option<(ManifestUpdate, Checkpoint)>> {
    let manifest_key = &source.reference().key;
    let after = checkpoint.mark.saturating_sub(lag_ms);
    let entries = source.log_since(after).await?;
    if entries.iter().any(|entry| {
        !checkpoint.operations.contains(&entry.key.to_string())
            && covers_window(manifest_key, entry, after)
    }) {
        return Ok(None);
    }

    let mut combined = Value::Object(Default::default());
    let mut mark = checkpoint.mark;
    let mut seen: Vec<(u64, String)> = Vec::new();
    for entry in entries {
        let name = entry.key.to_string();
        if checkpoint.operations.contains(&name) || checkpoint_only(&entry.file.update) {
            continue;
        }
        combined = compose(&combined, &entry.file.update.to_value());
        mark = mark.max(entry.key.timestamp);
        seen.push((entry.key.timestamp, name));
        report.scanned += 1;
    }

    let horizon = mark.saturating_sub(lag_ms);
    let operations = checkpoint
        .operations
        .iter()
        .filter_map(|name| {
            LogKey::parse(manifest_key, name)
                .ok()
                .map(|k| (k.timestamp, name.clone()))
        })
        .chain(seen)
        .filter(|(timestamp, _)| *timestamp > horizon)
        .map(|(_, name)| name)
        .collect();

    let changes = ManifestUpdate::from_value(&combined)?;
    Ok(Some((changes, Checkpoint { mark, operations })))
}

/// Replicates one manifest into another on demand or on a timer.
#[derive(Debug, Clone)]
pub struct Mirror {
    source: Manifest,
    target: Manifest,
    lag: Duration,
}

impl Mirror {
    /// Creates a mirror from `source` into `target`.
    pub fn new(source: Manifest, target: Manifest) -> Self {
        Self {
            source,
            target,
            lag: DEFAULT_LAG,
        }
    }

    /// Sets how far back each run re-reads the source log.
    ///
    /// Should cover the time entries can take to become visible in a
    /// listing.
    pub fn with_lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }

    /// The manifest replicated from.
    pub fn source(&self) -> &Manifest {
        &self.source
    }

    /// The manifest replicated into.
    pub fn target(&self) -> &Manifest {
        &self.target
    }

    /// Reads the current checkpoint.
    ///
    /// # Errors
    ///
    /// See [`load_checkpoint`].
    pub async fn checkpoint(&self) -> EngineResult<Checkpoint> {
        load_checkpoint(&self.target, &self.source).await
    }

    /// Runs one replication pass.
    ///
    /// # Errors
    ///
    /// See [`replicate`].
    pub async fn run(&self) -> EngineResult<ReplicationReport> {
        let checkpoint = self.checkpoint().await?;
        let (report, _) = replicate(&self.target, &self.source, &checkpoint, self.lag).await?;
        Ok(report)
    }

    /// Runs a pass every `interval` until the handle is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run().await {
                    warn!(
                        source = %self.source.reference(),
                        target = %self.target.reference(),
                        error = %e,
                        "replication pass failed"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::ClientConfig;
    use bucketlog_storage::InMemoryObjectStore;
    use serde_json::json;
    use std::sync::Arc;

    fn pair() -> (Client, Client) {
        let store = Arc::new(InMemoryObjectStore::new());
        let a = Client::new(ClientConfig::new("a").with_replication_id(0), store.clone());
        let b = Client::new(ClientConfig::new("b").with_replication_id(1), store);
        (a, b)
    }

    #[test]
    fn checkpoint_serializes_as_plain_json() {
        let checkpoint = Checkpoint {
            mark: 42,
            operations: ["m@x".to_string()].into_iter().collect(),
        };
        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value, json!({"mark": 42, "operations": ["m@x"]}));
        let back: Checkpoint = serde_json::from_value(json!({"mark": 7})).unwrap();
        assert_eq!(back.mark, 7);
        assert!(back.operations.is_empty());
    }

    #[test]
    fn checkpoint_only_updates() {
        let mut update = ManifestUpdate::new();
        update.set(
            &ResolvedReference::new("b", ".mirror/a/manifest.json"),
            bucketlog_protocol::FileState::new("1"),
        );
        assert!(checkpoint_only(&update));
        update.delete(&ResolvedReference::new("b", "k"));
        assert!(!checkpoint_only(&update));
    }

    #[test]
    fn snapshots_covering_the_window_are_detected() {
        let entry = |at: u64, previous: Option<u64>| LogEntry {
            key: LogKey::new("m", at, "s", 0).unwrap(),
            file: Arc::new(match previous {
                Some(p) => bucketlog_protocol::ManifestFile::snapshot(
                    bucketlog_protocol::ManifestState::new(),
                    LogKey::new("m", p, "s", 1).unwrap().to_string(),
                ),
                None => bucketlog_protocol::ManifestFile::delta(ManifestUpdate::new()),
            }),
        };
        assert!(covers_window("m", &entry(500, Some(400)), 300));
        assert!(!covers_window("m", &entry(500, Some(200)), 300));
        assert!(!covers_window("m", &entry(500, None), 300));
    }

    #[tokio::test]
    async fn first_run_copies_state_and_maps_bucket() {
        let (a, b) = pair();
        a.put("k", json!(1)).await.unwrap();
        a.put("gone", json!(2)).await.unwrap();
        a.delete("gone").await.unwrap();

        let mirror = Mirror::new(a.manifest(), b.manifest());
        let report = mirror.run().await.unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(report.deleted, 0);
        assert!(report.committed);

        assert_eq!(b.get("k").await.unwrap(), Some(json!(1)));
        let state = b.manifest().state().await.unwrap();
        let file = state.get(&ResolvedReference::new("b", "k")).unwrap();
        let mut bits = Provenance::with_bit(0);
        bits.insert(1);
        assert_eq!(file.provenance(), bits);

        let checkpoint = mirror.checkpoint().await.unwrap();
        assert!(checkpoint.mark > 0);
    }

    #[tokio::test]
    async fn second_run_without_changes_writes_nothing() {
        let (a, b) = pair();
        a.put("k", json!(1)).await.unwrap();
        let mirror = Mirror::new(a.manifest(), b.manifest());
        mirror.run().await.unwrap();
        b.manifest().state().await.unwrap();

        let before = b.manifest().listed_keys().len();
        let report = mirror.run().await.unwrap();
        assert!(!report.committed);
        assert_eq!(report.copied, 0);
        b.manifest().state().await.unwrap();
        assert_eq!(b.manifest().listed_keys().len(), before);
    }

    #[tokio::test]
    async fn incremental_run_copies_updates_and_deletes() {
        let (a, b) = pair();
        a.put("k", json!(1)).await.unwrap();
        a.put("j", json!(1)).await.unwrap();
        let mirror = Mirror::new(a.manifest(), b.manifest());
        mirror.run().await.unwrap();

        a.put("k", json!(2)).await.unwrap();
        a.delete("j").await.unwrap();
        let report = mirror.run().await.unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(b.get("k").await.unwrap(), Some(json!(2)));
        assert_eq!(b.get("j").await.unwrap(), None);
    }

    #[tokio::test]
    async fn target_without_replication_id_is_rejected() {
        let store = Arc::new(InMemoryObjectStore::new());
        let a = Client::new(ClientConfig::new("a").with_replication_id(0), store.clone());
        let b = Client::new(ClientConfig::new("b"), store);
        let err = Mirror::new(a.manifest(), b.manifest()).run().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}
