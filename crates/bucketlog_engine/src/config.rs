//! Configuration for clients and manifests.

use std::time::Duration;

/// How far a write must get before it is reported as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// The write is recorded in the operation queue (and the local store,
    /// if one is attached). Upload and commit continue in the background.
    Local,
    /// The log entry carrying the write has been acknowledged by the store.
    #[default]
    Remote,
}

/// Tuning for log folding, compaction and clock handling.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Largest accepted distance between a log key's timestamp and the
    /// store's last-modified time for it.
    pub clock_skew_tolerance: Duration,
    /// How far past local time the list cursor starts.
    pub list_slack: Duration,
    /// Age after which an entry can no longer be preceded by a late
    /// writer, and so may be folded into a snapshot.
    pub settle_window: Duration,
    /// Grace period before entries covered by a snapshot are deleted.
    pub gc_window: Duration,
    /// Replayed entries past the last snapshot that trigger compaction.
    pub compaction_threshold: usize,
    /// Log entries written and discarded for skew before giving up.
    pub max_clock_retries: u32,
    /// Folds restarted because an entry vanished before giving up.
    pub max_fold_attempts: u32,
    /// Whether skewed entries found while listing are deleted.
    pub delete_invalid_entries: bool,
}

impl SyncConfig {
    /// Creates a configuration with default tuning.
    pub fn new() -> Self {
        Self {
            clock_skew_tolerance: Duration::from_secs(5),
            list_slack: Duration::from_secs(5),
            settle_window: Duration::from_secs(15),
            gc_window: Duration::from_secs(60),
            compaction_threshold: 64,
            max_clock_retries: 3,
            max_fold_attempts: 3,
            delete_invalid_entries: true,
        }
    }

    /// Sets the clock skew tolerance.
    pub fn with_clock_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_skew_tolerance = tolerance;
        self
    }

    /// Sets the list cursor slack.
    pub fn with_list_slack(mut self, slack: Duration) -> Self {
        self.list_slack = slack;
        self
    }

    /// Sets the settle window.
    pub fn with_settle_window(mut self, window: Duration) -> Self {
        self.settle_window = window;
        self
    }

    /// Sets the garbage collection window.
    pub fn with_gc_window(mut self, window: Duration) -> Self {
        self.gc_window = window;
        self
    }

    /// Sets the compaction threshold.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Sets the maximum number of clock skew retries.
    pub fn with_max_clock_retries(mut self, retries: u32) -> Self {
        self.max_clock_retries = retries;
        self
    }

    /// Sets whether skewed entries are deleted.
    pub fn with_delete_invalid_entries(mut self, delete: bool) -> Self {
        self.delete_invalid_entries = delete;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bucket used for references that name none.
    pub bucket: String,
    /// Manifest key used when no manifest is named.
    pub manifest_key: String,
    /// Session id written into every log key; `[0-9a-z]`, at most 32 chars.
    pub session_id: String,
    /// Whether content is addressed by bucket version ids.
    pub use_versioning: bool,
    /// Whether the client starts online.
    pub online: bool,
    /// Whether readers check the poll pointer before listing.
    pub minimize_list_calls: bool,
    /// Whether the clock offset is corrected from server dates.
    pub adaptive_clock: bool,
    /// Interval between polls while anything is subscribed.
    pub poll_interval: Duration,
    /// This client's bit in replication provenance, if it takes part.
    pub replication_id: Option<usize>,
    /// Log tuning.
    pub sync: SyncConfig,
}

impl ClientConfig {
    /// Creates a configuration for a default bucket.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            manifest_key: "manifest.json".to_string(),
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            use_versioning: true,
            online: true,
            minimize_list_calls: false,
            adaptive_clock: true,
            poll_interval: Duration::from_secs(1),
            replication_id: None,
            sync: SyncConfig::default(),
        }
    }

    /// Sets the default manifest key.
    pub fn with_manifest_key(mut self, key: impl Into<String>) -> Self {
        self.manifest_key = key.into();
        self
    }

    /// Sets the session id.
    pub fn with_session_id(mut self, session: impl Into<String>) -> Self {
        self.session_id = session.into();
        self
    }

    /// Sets whether content is addressed by version ids.
    pub fn with_versioning(mut self, enabled: bool) -> Self {
        self.use_versioning = enabled;
        self
    }

    /// Sets whether the client starts online.
    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Sets whether the poll pointer is used.
    pub fn with_minimize_list_calls(mut self, enabled: bool) -> Self {
        self.minimize_list_calls = enabled;
        self
    }

    /// Sets whether the clock offset adapts to server dates.
    pub fn with_adaptive_clock(mut self, enabled: bool) -> Self {
        self.adaptive_clock = enabled;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the replication provenance bit.
    pub fn with_replication_id(mut self, id: usize) -> Self {
        self.replication_id = Some(id);
        self
    }

    /// Sets the log tuning.
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new("bucket")
            .with_manifest_key("app/manifest.json")
            .with_session_id("abc")
            .with_versioning(false)
            .with_online(false)
            .with_poll_interval(Duration::from_millis(50))
            .with_replication_id(3);

        assert_eq!(config.bucket, "bucket");
        assert_eq!(config.manifest_key, "app/manifest.json");
        assert_eq!(config.session_id, "abc");
        assert!(!config.use_versioning);
        assert!(!config.online);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.replication_id, Some(3));
    }

    #[test]
    fn default_session_ids_are_distinct_and_valid() {
        let a = ClientConfig::default().session_id;
        let b = ClientConfig::default().session_id;
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn settle_window_exceeds_skew_allowance() {
        let sync = SyncConfig::default();
        assert!(sync.settle_window > sync.clock_skew_tolerance + sync.list_slack);
        assert!(sync.gc_window > sync.settle_window);
    }

    #[test]
    fn default_durability_is_remote() {
        assert_eq!(Durability::default(), Durability::Remote);
    }
}
