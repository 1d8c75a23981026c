//! Asynchronous batched soft deletion.
//!
//! Deletion requests take the following path:
//!
//! ```text
//! caller -> DeleteIntake -> entry queue -> Aggregator -> batch queue -> DeleteWorker xN -> BatchApplier
//! ```
//!
//! - The [`DeleteIntake`] only hands entries to a bounded queue, so callers
//!   never wait on the database. A full queue suspends the caller until the
//!   aggregator catches up.
//! - The aggregator is the single owner of the pending buffer. It cuts a
//!   [`Batch`] when the buffer reaches `batch_size` or when the flush timer
//!   fires with anything buffered, whichever comes first.
//! - Workers pull whole batches, group them by user and hand them to a
//!   [`BatchApplier`], which applies every group as one atomic unit. A failed
//!   batch is logged and dropped; the worker keeps serving the queue.
//! - [`DeletePipeline::shutdown`] rejects new entries, drains both queues and
//!   waits for the workers, bounded by `shutdown_timeout`.

mod aggregator;
mod intake;
mod worker;

pub use intake::DeleteIntake;

use crate::pipeline::aggregator::Aggregator;
use crate::pipeline::worker::DeleteWorker;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use stubby_core::error::{Result, StorageError};
use stubby_core::{ShortCode, UserId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// One unit of deletion work: `user_id` gives up its claim on `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub user_id: UserId,
    pub code: ShortCode,
}

impl DeleteEntry {
    pub fn new(user_id: UserId, code: ShortCode) -> Self {
        Self { user_id, code }
    }
}

/// Entries of one user inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDeletes {
    pub user_id: UserId,
    pub codes: Vec<ShortCode>,
}

/// An insertion-ordered group of delete entries consumed by one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<DeleteEntry>,
}

impl Batch {
    pub fn new(entries: Vec<DeleteEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DeleteEntry] {
        &self.entries
    }

    /// Groups the entries by owning user, ordered by user id.
    ///
    /// Codes keep their batch order inside each group.
    pub fn group_by_user(&self) -> Vec<UserDeletes> {
        let mut groups: BTreeMap<&UserId, Vec<ShortCode>> = BTreeMap::new();
        for entry in &self.entries {
            groups
                .entry(&entry.user_id)
                .or_default()
                .push(entry.code.clone());
        }

        groups
            .into_iter()
            .map(|(user_id, codes)| UserDeletes {
                user_id: user_id.clone(),
                codes,
            })
            .collect()
    }
}

/// Persists grouped soft deletes.
///
/// Implementations must apply all groups atomically: either every group is
/// committed or none is.
#[async_trait]
pub trait BatchApplier: Send + Sync + 'static {
    async fn apply(&self, groups: &[UserDeletes]) -> Result<()>;
}

/// Tuning knobs of the [`DeletePipeline`].
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct PipelineConfig {
    /// Buffered entries that trigger an immediate batch.
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// Maximum time a non-empty buffer waits before being flushed.
    #[builder(default = DEFAULT_FLUSH_INTERVAL)]
    pub flush_interval: Duration,
    /// Number of concurrent workers applying batches.
    #[builder(default = default_workers())]
    pub workers: usize,
    /// Capacity of the intake queue in front of the aggregator.
    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
    /// Deadline for draining the pipeline on shutdown.
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT)]
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PipelineConfig {
    fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.workers = self.workers.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self.flush_interval = self.flush_interval.max(Duration::from_millis(1));
        self
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

struct PipelineTasks {
    aggregator: JoinHandle<()>,
    workers: JoinSet<()>,
}

enum PipelineState {
    Running(PipelineTasks),
    /// Outcome of the drain, handed to every later shutdown call.
    Stopped(Result<()>),
}

/// A running delete pipeline: one aggregator task and a pool of workers.
pub struct DeletePipeline {
    intake: DeleteIntake,
    shutdown: CancellationToken,
    state: Mutex<PipelineState>,
    shutdown_timeout: Duration,
}

impl DeletePipeline {
    /// Spawns the aggregator and workers on the current tokio runtime.
    pub fn spawn<A: BatchApplier>(applier: Arc<A>, config: PipelineConfig) -> Self {
        let config = config.normalized();
        let shutdown = CancellationToken::new();

        let (entry_tx, entry_rx) = mpsc::channel(config.queue_capacity);
        // One slot per worker keeps the aggregator from running far ahead of
        // the database.
        let (batch_tx, batch_rx) = mpsc::channel(config.workers);

        let aggregator = Aggregator::new(
            entry_rx,
            batch_tx,
            config.batch_size,
            config.flush_interval,
            shutdown.clone(),
        );
        let aggregator = tokio::spawn(aggregator.run());

        let batch_rx = Arc::new(Mutex::new(batch_rx));
        let mut workers = JoinSet::new();
        for id in 0..config.workers {
            let worker = DeleteWorker::new(id, Arc::clone(&batch_rx), Arc::clone(&applier));
            workers.spawn(worker.run());
        }

        info!(
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "delete pipeline started"
        );

        Self {
            intake: DeleteIntake::new(entry_tx, shutdown.clone()),
            shutdown,
            state: Mutex::new(PipelineState::Running(PipelineTasks {
                aggregator,
                workers,
            })),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Returns a handle for submitting deletion requests.
    pub fn intake(&self) -> &DeleteIntake {
        &self.intake
    }

    /// Submits one deletion request. See [`DeleteIntake::enqueue`].
    pub async fn enqueue(&self, user_id: UserId, code: ShortCode) -> Result<()> {
        self.intake.enqueue(user_id, code).await
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops intake and drains every buffered entry into the applier.
    ///
    /// Waits until the aggregator flushed its remaining buffer and every
    /// worker emptied the batch queue. If that takes longer than the
    /// configured deadline the remaining tasks are aborted, which rolls back
    /// their open transactions, and `Timeout` is returned.
    ///
    /// Concurrent and repeated calls all wait for the same drain and return
    /// its outcome.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        // Held until the drain finishes so a concurrent caller cannot return
        // while batches are still being applied.
        let mut state = self.state.lock().await;
        let tasks = match std::mem::replace(&mut *state, PipelineState::Stopped(Ok(()))) {
            PipelineState::Running(tasks) => tasks,
            PipelineState::Stopped(outcome) => {
                *state = PipelineState::Stopped(outcome.clone());
                return outcome;
            }
        };

        let outcome = self.drain(tasks).await;
        *state = PipelineState::Stopped(outcome.clone());
        outcome
    }

    async fn drain(&self, tasks: PipelineTasks) -> Result<()> {
        let PipelineTasks {
            aggregator,
            mut workers,
        } = tasks;

        let aggregator_abort = aggregator.abort_handle();
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            if let Err(err) = aggregator.await {
                error!(error = %err, "delete aggregator task failed");
            }
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "delete worker task failed");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("delete pipeline drained");
                Ok(())
            }
            Err(_) => {
                aggregator_abort.abort();
                workers.abort_all();
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "delete pipeline drain deadline elapsed, aborting in-flight batches"
                );
                Err(StorageError::Timeout(format!(
                    "delete pipeline did not drain within {:?}",
                    self.shutdown_timeout
                )))
            }
        }
    }
}

impl Drop for DeletePipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use std::future::pending;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stubby_core::LinkStorage;

    fn user(id: &str) -> UserId {
        UserId::new_unchecked(id)
    }

    fn code(value: &str) -> ShortCode {
        ShortCode::new_unchecked(value)
    }

    fn entry(user_id: &str, value: &str) -> DeleteEntry {
        DeleteEntry::new(user(user_id), code(value))
    }

    fn quiet_config() -> PipelineConfig {
        // Nothing flushes on its own; only shutdown drains.
        PipelineConfig::builder()
            .batch_size(5)
            .flush_interval(Duration::from_secs(3600))
            .workers(2)
            .build()
    }

    async fn seeded_store(links: &[(&str, &str, &str)]) -> Arc<MemoryStorage> {
        let store = Arc::new(MemoryStorage::new());
        for (user_id, value, url) in links {
            store.put(&user(user_id), &code(value), url).await.unwrap();
        }
        store
    }

    struct StalledApplier;

    /// Counts applied entries, taking a while per batch.
    #[derive(Default)]
    struct SlowCountingApplier {
        applied: AtomicUsize,
    }

    #[async_trait]
    impl BatchApplier for SlowCountingApplier {
        async fn apply(&self, groups: &[UserDeletes]) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let entries: usize = groups.iter().map(|group| group.codes.len()).sum();
            self.applied.fetch_add(entries, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl BatchApplier for StalledApplier {
        async fn apply(&self, _groups: &[UserDeletes]) -> Result<()> {
            pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn group_by_user_keeps_code_order() {
        let batch = Batch::new(vec![
            entry("bob", "b1"),
            entry("alice", "a1"),
            entry("bob", "b2"),
            entry("alice", "a2"),
        ]);

        let groups = batch.group_by_user();

        assert_eq!(
            groups,
            vec![
                UserDeletes {
                    user_id: user("alice"),
                    codes: vec![code("a1"), code("a2")],
                },
                UserDeletes {
                    user_id: user("bob"),
                    codes: vec![code("b1"), code("b2")],
                },
            ]
        );
    }

    #[test]
    fn config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 1024);
        assert!(config.workers >= 1);
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let config = PipelineConfig::builder()
            .batch_size(0)
            .workers(0)
            .queue_capacity(0)
            .flush_interval(Duration::ZERO)
            .build()
            .normalized();

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.workers, 1);
        assert_eq!(config.queue_capacity, 1);
        assert!(!config.flush_interval.is_zero());
    }

    #[tokio::test]
    async fn shutdown_persists_entries_below_threshold() {
        let store = seeded_store(&[
            ("alice", "abc123", "https://example.com/1"),
            ("alice", "def456", "https://example.com/2"),
            ("alice", "ghi789", "https://example.com/3"),
        ])
        .await;
        let pipeline = DeletePipeline::spawn(Arc::clone(&store), quiet_config());

        for value in ["abc123", "def456", "ghi789"] {
            pipeline.enqueue(user("alice"), code(value)).await.unwrap();
        }
        pipeline.shutdown().await.unwrap();

        assert!(store.get_user_links(&user("alice")).await.unwrap().is_empty());
        assert!(matches!(
            store.get(&code("abc123")).await,
            Err(StorageError::Deleted(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let store = Arc::new(MemoryStorage::new());
        let pipeline = DeletePipeline::spawn(store, quiet_config());

        pipeline.shutdown().await.unwrap();
        let err = pipeline
            .enqueue(user("alice"), code("abc123"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Closed(_)));
        assert!(pipeline.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_twice_is_a_no_op() {
        let store = Arc::new(MemoryStorage::new());
        let pipeline = DeletePipeline::spawn(store, quiet_config());

        pipeline.shutdown().await.unwrap();
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_shutdowns_both_wait_for_the_drain() {
        let applier = Arc::new(SlowCountingApplier::default());
        let pipeline = DeletePipeline::spawn(
            Arc::clone(&applier),
            PipelineConfig::builder()
                .batch_size(1)
                .flush_interval(Duration::from_secs(3600))
                .workers(1)
                .build(),
        );
        for n in 0..20 {
            pipeline
                .enqueue(user("alice"), code(&format!("code{n:02}")))
                .await
                .unwrap();
        }

        let first = async {
            pipeline.shutdown().await.unwrap();
            applier.applied.load(Ordering::SeqCst)
        };
        let second = async {
            pipeline.shutdown().await.unwrap();
            applier.applied.load(Ordering::SeqCst)
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first, 20);
        assert_eq!(second, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_after_timeout_reports_timeout_again() {
        let pipeline = DeletePipeline::spawn(
            Arc::new(StalledApplier),
            PipelineConfig::builder()
                .batch_size(1)
                .workers(1)
                .shutdown_timeout(Duration::from_millis(50))
                .build(),
        );

        pipeline.enqueue(user("alice"), code("abc123")).await.unwrap();
        let first = pipeline.shutdown().await.unwrap_err();
        let second = pipeline.shutdown().await.unwrap_err();

        assert!(matches!(first, StorageError::Timeout(_)));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ownership_is_isolated_between_users() {
        let store = seeded_store(&[
            ("alice", "shared1", "https://example.com"),
            ("bob", "shared1", "https://example.com"),
        ])
        .await;
        let pipeline = DeletePipeline::spawn(Arc::clone(&store), quiet_config());

        pipeline.enqueue(user("alice"), code("shared1")).await.unwrap();
        pipeline.shutdown().await.unwrap();

        assert_eq!(
            store.get(&code("shared1")).await.unwrap(),
            "https://example.com"
        );

        store
            .delete_batch(&[code("shared1")], &user("bob"))
            .await
            .unwrap();
        assert!(matches!(
            store.get(&code("shared1")).await,
            Err(StorageError::Deleted(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_callers_fan_in_without_losses() {
        let store = Arc::new(MemoryStorage::new());
        for u in 0..8 {
            for c in 0..10 {
                store
                    .put(
                        &user(&format!("user-{u}")),
                        &code(&format!("code-{c:02}")),
                        &format!("https://example.com/{c}"),
                    )
                    .await
                    .unwrap();
            }
        }
        let pipeline = Arc::new(DeletePipeline::spawn(
            Arc::clone(&store),
            PipelineConfig::builder()
                .batch_size(7)
                .queue_capacity(4)
                .workers(3)
                .build(),
        ));

        let mut callers = JoinSet::new();
        for u in 0..8 {
            let pipeline = Arc::clone(&pipeline);
            callers.spawn(async move {
                for c in 0..10 {
                    pipeline
                        .enqueue(user(&format!("user-{u}")), code(&format!("code-{c:02}")))
                        .await
                        .unwrap();
                }
            });
        }
        while let Some(joined) = callers.join_next().await {
            joined.unwrap();
        }
        pipeline.shutdown().await.unwrap();

        for u in 0..8 {
            let links = store
                .get_user_links(&user(&format!("user-{u}")))
                .await
                .unwrap();
            assert!(links.is_empty(), "user-{u} still has {links:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_deadline() {
        let pipeline = DeletePipeline::spawn(
            Arc::new(StalledApplier),
            PipelineConfig::builder()
                .batch_size(1)
                .workers(1)
                .shutdown_timeout(Duration::from_millis(50))
                .build(),
        );

        pipeline.enqueue(user("alice"), code("abc123")).await.unwrap();
        let err = pipeline.shutdown().await.unwrap_err();

        assert!(matches!(err, StorageError::Timeout(_)));
    }
}
