//! A handle on one manifest: reads, writes and subscriptions.
//!
//! Reads check the operation queue first, so a client always sees its own
//! pending writes. Writes go through four steps: propose the values,
//! upload their content, commit a log entry, and wait for a fold to
//! observe it.
//!
//! Subscriptions are served by a poll task that runs only while at least
//! one subscriber exists. Each subscriber receives notifications on its
//! own channel, so a slow handler never delays the others.

use crate::clock::ClockContext;
use crate::config::{ClientConfig, Durability};
use crate::content::ContentStore;
use crate::error::{EngineError, EngineResult};
use crate::queue::{OperationHandle, OperationQueue, RestoredOperation, ValueSet};
use crate::syncer::{LogEntry, Syncer};
use bucketlog_protocol::{FileState, ManifestState, ManifestUpdate, Provenance, ResolvedReference};
use bucketlog_storage::{LocalStore, ObjectStore};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Version reported for values that are only known locally.
pub const LOCAL_VERSION: &str = "local";

/// Provenance to record per reference, overriding the writer's own bit.
pub type ProvenanceMap = HashMap<ResolvedReference, Provenance>;

/// What happened to a subscribed reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The reference holds a value.
    Value {
        /// Current value.
        value: Value,
        /// Its version, or [`LOCAL_VERSION`] while the write is pending.
        version: String,
    },
    /// The reference was deleted.
    Deleted,
}

/// Delivered to a subscriber when its reference changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// The subscribed reference.
    pub reference: ResolvedReference,
    /// What it changed to.
    pub change: Change,
}

/// Identifies a subscription for [`Manifest::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Observed {
    Local(Option<Value>),
    Remote(String),
    Deleted,
}

struct Subscriber {
    reference: ResolvedReference,
    last: Option<Observed>,
    sender: mpsc::UnboundedSender<Notification>,
}

/// A write waiting for, or handed to, the manifest's writer.
enum Work {
    Write {
        handle: OperationHandle,
        values: ValueSet,
        provenance: ProvenanceMap,
    },
    /// Recovered with a label; committed only if the log lacks it.
    Restored {
        handle: OperationHandle,
        label: String,
        versions: ManifestUpdate,
    },
}

impl Work {
    fn handle(&self) -> OperationHandle {
        match self {
            Self::Write { handle, .. } | Self::Restored { handle, .. } => *handle,
        }
    }
}

/// What the writer does with work interrupted by going offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnOffline {
    Cancel,
    Defer,
}

struct Job {
    inner: Arc<ManifestInner>,
    work: Work,
    offline: OnOffline,
    reply: Option<oneshot::Sender<EngineResult<()>>>,
}

struct ManifestInner {
    reference: ResolvedReference,
    syncer: Syncer,
    queue: Arc<OperationQueue>,
    content: Arc<ContentStore>,
    online: Arc<AtomicBool>,
    replication_id: Option<usize>,
    poll_interval: Duration,
    polling: AtomicBool,
    repoll: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    next_subscriber: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
    deferred: Mutex<Vec<Work>>,
    /// Commits run one at a time, in the order they were handed over.
    writer: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

/// Cheaply cloneable handle on one manifest.
#[derive(Clone)]
pub struct Manifest {
    inner: Arc<ManifestInner>,
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("reference", &self.inner.reference)
            .field("pending", &self.inner.queue.len())
            .finish()
    }
}

/// Clears the polling flag when a poll ends, including by error.
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Manifest {
    /// Opens the manifest at `reference`.
    ///
    /// With a local store, pending operations are persisted under
    /// `queue/<reference>` and the folded state under `cache/<reference>`.
    pub fn open(
        reference: ResolvedReference,
        store: Arc<dyn ObjectStore>,
        local: Option<Arc<dyn LocalStore>>,
        content: Arc<ContentStore>,
        clock: Arc<ClockContext>,
        online: Arc<AtomicBool>,
        config: &ClientConfig,
    ) -> Self {
        let queue = Arc::new(match &local {
            Some(local) => {
                OperationQueue::durable(Arc::clone(local), format!("queue/{reference}"))
            }
            None => OperationQueue::new(),
        });
        let syncer = Syncer::new(
            reference.clone(),
            store,
            local,
            Arc::clone(&queue),
            clock,
            Arc::clone(&online),
            config,
        );
        Self {
            inner: Arc::new(ManifestInner {
                reference,
                syncer,
                queue,
                content,
                online,
                replication_id: config.replication_id,
                poll_interval: config.poll_interval,
                polling: AtomicBool::new(false),
                repoll: AtomicBool::new(false),
                poll_task: Mutex::new(None),
                next_subscriber: AtomicU64::new(0),
                subscribers: Mutex::new(BTreeMap::new()),
                deferred: Mutex::new(Vec::new()),
                writer: Mutex::new(None),
            }),
        }
    }

    /// Location of the manifest log.
    pub fn reference(&self) -> &ResolvedReference {
        &self.inner.reference
    }

    /// Replication bit of the owning client, if any.
    pub fn replication_id(&self) -> Option<usize> {
        self.inner.replication_id
    }

    /// Pending operations of this manifest.
    pub fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    /// Content store used for values.
    pub fn content(&self) -> &ContentStore {
        &self.inner.content
    }

    /// Folds the log and returns the current state.
    ///
    /// # Errors
    ///
    /// Returns any fold error.
    pub async fn state(&self) -> EngineResult<ManifestState> {
        self.inner.syncer.get_latest().await
    }

    /// Returns the state of the last fold without touching the network.
    pub fn cached_state(&self) -> ManifestState {
        self.inner.syncer.cached()
    }

    /// Keys listed by the last fold, newest first.
    pub fn listed_keys(&self) -> Vec<String> {
        self.inner.syncer.listed_keys()
    }

    /// Returns log entries newer than `after`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Offline`] or any store error.
    pub async fn log_since(&self, after: u64) -> EngineResult<Vec<LogEntry>> {
        self.inner.syncer.log_since(after).await
    }

    /// Reads a value. Pending local writes win over the folded state.
    ///
    /// # Errors
    ///
    /// Returns any fold or download error.
    pub async fn get(&self, reference: &ResolvedReference) -> EngineResult<Option<Value>> {
        if let Some(pending) = self.inner.queue.get(reference) {
            return Ok(pending);
        }
        let state = self.inner.syncer.get_latest().await?;
        if let Some(pending) = self.inner.queue.get(reference) {
            return Ok(pending);
        }
        match state.get(reference) {
            Some(file) => self.inner.content.download(reference, &file.version).await,
            None => Ok(None),
        }
    }

    /// Writes a batch of values atomically; `None` deletes.
    ///
    /// With [`Durability::Remote`] this returns once the log entry is
    /// written. With [`Durability::Local`] it returns once the operation
    /// is queued (and persisted, given a local store) and finishes the
    /// write in the background. Offline, local writes are deferred until
    /// [`Manifest::flush`].
    ///
    /// Writes reach the log in the order they were proposed, whatever
    /// their durability.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Offline`] for a remote write while offline,
    /// or any error from the write pipeline.
    pub async fn update_content(
        &self,
        values: ValueSet,
        durability: Durability,
    ) -> EngineResult<OperationHandle> {
        self.update_with_provenance(values, ProvenanceMap::new(), durability)
            .await
    }

    /// Like [`Manifest::update_content`], recording `provenance` for the
    /// listed references instead of the writer's own bit.
    ///
    /// # Errors
    ///
    /// Same as [`Manifest::update_content`].
    pub async fn update_with_provenance(
        &self,
        values: ValueSet,
        provenance: ProvenanceMap,
        durability: Durability,
    ) -> EngineResult<OperationHandle> {
        if !self.inner.is_online() && durability == Durability::Remote {
            return Err(EngineError::Offline);
        }

        let handle = self.inner.queue.propose(values.clone()).await?;
        self.inner.poll_soon();
        self.inner
            .dispatch(
                Work::Write {
                    handle,
                    values,
                    provenance,
                },
                durability,
            )
            .await?;
        Ok(handle)
    }

    /// Resumes an operation recovered from the local store.
    ///
    /// An operation that never got a label is written again from its
    /// values. A labeled one is re-queued under the same label; if the
    /// log already holds that entry the next fold confirms it, otherwise
    /// its recorded versions are committed without re-uploading content.
    ///
    /// # Errors
    ///
    /// Returns any queue error, or any write error when `durability` is
    /// [`Durability::Remote`].
    pub async fn resume(
        &self,
        operation: RestoredOperation,
        durability: Durability,
    ) -> EngineResult<()> {
        let (label, versions) = match (operation.label, operation.versions) {
            (Some(label), Some(versions)) => (label, versions),
            _ => {
                return self
                    .update_content(operation.values, durability)
                    .await
                    .map(|_| ())
            }
        };

        let handle = self.inner.queue.propose(operation.values).await?;
        self.inner.queue.label(handle, &label, &versions).await?;
        self.inner.poll_soon();
        self.inner
            .dispatch(
                Work::Restored {
                    handle,
                    label,
                    versions,
                },
                durability,
            )
            .await
    }

    /// Replays operations persisted by an earlier session.
    ///
    /// # Errors
    ///
    /// Returns the first error from the local store or a replay.
    pub async fn restore(&self) -> EngineResult<usize> {
        let restored = self
            .inner
            .queue
            .restore(|operation| {
                let manifest = self.clone();
                async move { manifest.resume(operation, Durability::Local).await }
            })
            .await?;
        if restored > 0 {
            debug!(manifest = %self.inner.reference, restored, "restored pending operations");
        }
        Ok(restored)
    }

    /// Commits writes deferred while offline, in order.
    ///
    /// Every deferred write is handed to the writer before any result is
    /// awaited, so writes made meanwhile queue up behind them. A write
    /// interrupted by going offline again is deferred again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Offline`] if still offline, otherwise the
    /// first failed write once all of them have finished.
    pub async fn flush(&self) -> EngineResult<usize> {
        if !self.inner.is_online() {
            return Err(EngineError::Offline);
        }
        let taken = std::mem::take(&mut *self.inner.deferred.lock());
        let replies: Vec<_> = taken
            .into_iter()
            .map(|work| {
                let (reply, done) = oneshot::channel();
                self.inner.submit(work, OnOffline::Defer, Some(reply));
                done
            })
            .collect();

        let mut flushed = 0;
        let mut failure = None;
        for done in replies {
            match done.await.unwrap_or(Err(EngineError::Cancelled)) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if flushed > 0 {
            debug!(manifest = %self.inner.reference, flushed, "flushed deferred writes");
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Number of writes waiting for the client to come online.
    pub fn deferred_len(&self) -> usize {
        self.inner.deferred.lock().len()
    }

    /// Calls `handler` whenever the value at `reference` changes.
    ///
    /// The first subscription starts the poll task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn subscribe<F>(&self, reference: ResolvedReference, handler: F) -> SubscriptionId
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                handler(notification);
            }
        });

        let id = SubscriptionId(self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst));
        let first = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.insert(
                id,
                Subscriber {
                    reference,
                    last: None,
                    sender,
                },
            );
            subscribers.len() == 1
        };
        debug!(%id, manifest = %self.inner.reference, "subscribed");

        if first {
            self.start_polling();
        } else {
            self.inner.poll_soon();
        }
        id
    }

    /// Removes a subscription; the last one stops the poll task.
    ///
    /// Returns false if `id` was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (removed, empty) = {
            let mut subscribers = self.inner.subscribers.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.is_empty())
        };
        if removed && empty {
            if let Some(task) = self.inner.poll_task.lock().take() {
                task.abort();
            }
            debug!(manifest = %self.inner.reference, "stopped polling");
        }
        removed
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Returns true while the poll task is running.
    pub fn is_polling(&self) -> bool {
        self.inner
            .poll_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Checks every subscribed reference and notifies the changed ones.
    ///
    /// A call made while another poll runs asks that poll to go around
    /// once more and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns any fold error.
    pub async fn poll(&self) -> EngineResult<()> {
        self.inner.poll().await
    }

    fn start_polling(&self) {
        let weak: Weak<ManifestInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = inner.poll().await {
                    warn!(manifest = %inner.reference, error = %e, "poll failed");
                }
            }
        });
        if let Some(previous) = self.inner.poll_task.lock().replace(task) {
            previous.abort();
        }
        debug!(manifest = %self.inner.reference, ?interval, "started polling");
    }
}

impl ManifestInner {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn own_provenance(&self) -> Provenance {
        self.replication_id
            .map(Provenance::with_bit)
            .unwrap_or_default()
    }

    fn defer(&self, work: Work) {
        self.deferred.lock().push(work);
    }

    /// Sends `work` on its way according to `durability`.
    ///
    /// Offline, local work is deferred. Online, anything still deferred
    /// goes to the writer first so it keeps its place in line.
    async fn dispatch(self: &Arc<Self>, work: Work, durability: Durability) -> EngineResult<()> {
        if durability == Durability::Local && !self.is_online() {
            debug!(handle = %work.handle(), manifest = %self.reference, "deferring write while offline");
            self.defer(work);
            return Ok(());
        }

        let deferred = std::mem::take(&mut *self.deferred.lock());
        for earlier in deferred {
            self.submit(earlier, OnOffline::Defer, None);
        }

        match durability {
            Durability::Remote => {
                let (reply, done) = oneshot::channel();
                self.submit(work, OnOffline::Cancel, Some(reply));
                done.await.unwrap_or(Err(EngineError::Cancelled))
            }
            Durability::Local => {
                self.submit(work, OnOffline::Defer, None);
                Ok(())
            }
        }
    }

    /// Queues `work` on the writer, starting it if needed.
    ///
    /// Without a reply channel, failures are only logged.
    fn submit(
        self: &Arc<Self>,
        work: Work,
        offline: OnOffline,
        reply: Option<oneshot::Sender<EngineResult<()>>>,
    ) {
        let job = Job {
            inner: Arc::clone(self),
            work,
            offline,
            reply,
        };
        let mut writer = self.writer.lock();
        if writer.as_ref().map_or(true, mpsc::UnboundedSender::is_closed) {
            let (sender, jobs) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(jobs));
            *writer = Some(sender);
        }
        if let Some(sender) = writer.as_ref() {
            if let Err(mpsc::error::SendError(job)) = sender.send(job) {
                warn!(handle = %job.work.handle(), "writer stopped, dropping write");
            }
        }
    }

    async fn run(self: &Arc<Self>, work: &Work) -> EngineResult<()> {
        match work {
            Work::Write {
                handle,
                values,
                provenance,
            } => self.commit_write(*handle, values, provenance).await.map(|_| ()),
            Work::Restored {
                handle,
                label,
                versions,
            } => self.finish_restored(*handle, label, versions).await,
        }
    }

    /// Uploads and commits, cancelling on failure. A write interrupted by
    /// going offline stays queued; the caller decides what to do with it.
    async fn commit_write(
        self: &Arc<Self>,
        handle: OperationHandle,
        values: &ValueSet,
        provenance: &ProvenanceMap,
    ) -> EngineResult<String> {
        let result = self.upload_and_commit(handle, values, provenance).await;
        match &result {
            Ok(_) => self.poll_soon(),
            Err(EngineError::Offline) => {}
            Err(e) => {
                warn!(%handle, error = %e, "write failed, cancelling");
                self.queue.cancel(handle).await;
                self.poll_soon();
            }
        }
        result
    }

    async fn upload_and_commit(
        &self,
        handle: OperationHandle,
        values: &ValueSet,
        provenance: &ProvenanceMap,
    ) -> EngineResult<String> {
        let mut update = ManifestUpdate::new();
        for (reference, value) in values {
            match value {
                Some(value) => {
                    let version = self.content.upload(reference, value).await?;
                    let replication = provenance
                        .get(reference)
                        .cloned()
                        .unwrap_or_else(|| self.own_provenance());
                    update.set(reference, FileState::new(version).with_replication(replication));
                }
                None => update.delete(reference),
            }
        }
        self.syncer.commit(handle, &update).await
    }

    /// Commits already uploaded versions, cancelling on failure.
    async fn commit_versions(
        self: &Arc<Self>,
        handle: OperationHandle,
        versions: &ManifestUpdate,
    ) -> EngineResult<String> {
        let result = self.syncer.commit(handle, versions).await;
        match &result {
            Ok(_) => self.poll_soon(),
            Err(EngineError::Offline) => {}
            Err(e) => {
                warn!(%handle, error = %e, "commit failed, cancelling");
                self.queue.cancel(handle).await;
                self.poll_soon();
            }
        }
        result
    }

    async fn finish_restored(
        self: &Arc<Self>,
        handle: OperationHandle,
        label: &str,
        versions: &ManifestUpdate,
    ) -> EngineResult<()> {
        self.syncer.get_latest().await?;
        if self.syncer.observed(label) {
            self.queue.confirm(label).await;
        }
        if !self.queue.contains(handle) {
            debug!(%handle, label, "restored write already in the log");
            return Ok(());
        }
        self.commit_versions(handle, versions).await.map(|_| ())
    }

    /// Schedules a poll if anyone is listening.
    fn poll_soon(self: &Arc<Self>) {
        if self.subscribers.lock().is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.poll().await {
                warn!(manifest = %inner.reference, error = %e, "poll failed");
            }
        });
    }

    async fn poll(&self) -> EngineResult<()> {
        if self.polling.swap(true, Ordering::SeqCst) {
            self.repoll.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let _guard = PollGuard(&self.polling);
        loop {
            self.repoll.store(false, Ordering::SeqCst);
            self.poll_once().await?;
            if !self.repoll.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    async fn poll_once(&self) -> EngineResult<()> {
        let targets: Vec<(SubscriptionId, ResolvedReference, Option<Observed>)> = {
            let subscribers = self.subscribers.lock();
            if subscribers.is_empty() {
                return Ok(());
            }
            subscribers
                .iter()
                .map(|(id, s)| (*id, s.reference.clone(), s.last.clone()))
                .collect()
        };

        let state = self.syncer.get_latest().await?;
        let pending = self.queue.flatten();

        for (id, reference, last) in targets {
            let observed = match (pending.get(&reference), state.get(&reference)) {
                (Some(value), _) => Observed::Local(value.clone()),
                (None, Some(file)) => Observed::Remote(file.version.clone()),
                (None, None) => Observed::Deleted,
            };
            if last.as_ref() == Some(&observed) {
                continue;
            }
            let change = match &observed {
                Observed::Local(Some(value)) => Change::Value {
                    value: value.clone(),
                    version: LOCAL_VERSION.to_string(),
                },
                Observed::Remote(version) => match self.content.download(&reference, version).await {
                    Ok(Some(value)) => Change::Value {
                        value,
                        version: version.clone(),
                    },
                    Ok(None) => {
                        warn!(%reference, %version, "subscribed content is missing");
                        continue;
                    }
                    Err(e) => {
                        warn!(%reference, %version, error = %e, "failed to download subscribed content");
                        continue;
                    }
                },
                Observed::Local(None) | Observed::Deleted => {
                    if matches!(last, None | Some(Observed::Deleted) | Some(Observed::Local(None))) {
                        continue;
                    }
                    Change::Deleted
                }
            };

            let mut subscribers = self.subscribers.lock();
            if let Some(subscriber) = subscribers.get_mut(&id) {
                subscriber.last = Some(observed);
                let notification = Notification {
                    reference,
                    change,
                };
                if subscriber.sender.send(notification).is_err() {
                    debug!(%id, "subscriber channel closed");
                }
            }
        }
        Ok(())
    }
}

/// Drains one manifest's writer. Each job holds the manifest alive only
/// while queued, so the loop ends once the manifest is dropped.
async fn run_writer(mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(Job {
        inner,
        work,
        offline,
        reply,
    }) = jobs.recv().await
    {
        let handle = work.handle();
        let result = inner.run(&work).await;
        if matches!(result, Err(EngineError::Offline)) {
            match offline {
                OnOffline::Cancel => {
                    inner.queue.cancel(handle).await;
                }
                OnOffline::Defer => inner.defer(work),
            }
        }
        match reply {
            Some(reply) => {
                if reply.send(result).is_err() {
                    debug!(%handle, "write finished after its caller left");
                }
            }
            None => match result {
                Ok(()) | Err(EngineError::Offline) => {}
                Err(e) => warn!(%handle, error = %e, "background write failed"),
            },
        }
    }
}

impl Drop for ManifestInner {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.get_mut().take() {
            task.abort();
        }
    }
}
