use crate::pipeline::{Batch, DeleteEntry};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Size,
    Timer,
    Shutdown,
}

impl Display for FlushReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushReason::Size => write!(f, "size"),
            FlushReason::Timer => write!(f, "timer"),
            FlushReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Coalesces delete entries into bounded batches.
///
/// Runs as a single task and is the only owner of `buffer`.
pub(crate) struct Aggregator {
    entries: mpsc::Receiver<DeleteEntry>,
    batches: mpsc::Sender<Batch>,
    batch_size: usize,
    flush_interval: Duration,
    shutdown: CancellationToken,
    buffer: Vec<DeleteEntry>,
}

impl Aggregator {
    pub(crate) fn new(
        entries: mpsc::Receiver<DeleteEntry>,
        batches: mpsc::Sender<Batch>,
        batch_size: usize,
        flush_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            entries,
            batches,
            batch_size,
            flush_interval,
            shutdown,
            buffer: Vec::with_capacity(batch_size),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                entry = self.entries.recv() => match entry {
                    Some(entry) => {
                        self.buffer.push(entry);
                        if self.buffer.len() >= self.batch_size {
                            self.flush(FlushReason::Size).await;
                            ticker.reset();
                        }
                    }
                    // Every intake handle is gone.
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush(FlushReason::Timer).await;
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Refuses further entries, then flushes everything already queued.
    async fn drain(mut self) {
        self.entries.close();
        while let Some(entry) = self.entries.recv().await {
            self.buffer.push(entry);
            if self.buffer.len() >= self.batch_size {
                self.flush(FlushReason::Shutdown).await;
            }
        }
        if !self.buffer.is_empty() {
            self.flush(FlushReason::Shutdown).await;
        }
        debug!("delete aggregator stopped");
    }

    async fn flush(&mut self, reason: FlushReason) {
        let entries = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let batch = Batch::new(entries);
        debug!(reason = %reason, size = batch.len(), "cutting delete batch");

        if let Err(mpsc::error::SendError(batch)) = self.batches.send(batch).await {
            error!(
                reason = %reason,
                discarded = batch.len(),
                "batch queue closed, discarding delete batch"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stubby_core::{ShortCode, UserId};
    use tokio::task::JoinHandle;

    const INTERVAL: Duration = Duration::from_secs(5);

    struct Harness {
        entries: mpsc::Sender<DeleteEntry>,
        batches: mpsc::Receiver<Batch>,
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn harness(batch_size: usize) -> Harness {
        let (entries, entry_rx) = mpsc::channel(64);
        let (batch_tx, batches) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let aggregator = Aggregator::new(entry_rx, batch_tx, batch_size, INTERVAL, shutdown.clone());

        Harness {
            entries,
            batches,
            shutdown,
            handle: tokio::spawn(aggregator.run()),
        }
    }

    fn entry(n: usize) -> DeleteEntry {
        DeleteEntry::new(
            UserId::new_unchecked(format!("user-{}", n % 2)),
            ShortCode::new_unchecked(format!("code-{n:03}")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_cuts_exactly_one_batch() {
        let mut h = harness(5);
        let start = Instant::now();

        for n in 0..5 {
            h.entries.send(entry(n)).await.unwrap();
        }

        let batch = h.batches.recv().await.unwrap();
        assert_eq!(batch.len(), 5);
        assert!(start.elapsed() < INTERVAL, "flushed by the timer instead");
        assert!(h.batches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_buffer() {
        let mut h = harness(5);
        let start = Instant::now();

        for n in 0..3 {
            h.entries.send(entry(n)).await.unwrap();
        }

        let batch = h.batches.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(start.elapsed() >= INTERVAL);
        assert_eq!(
            batch.entries().iter().map(|e| e.code.as_str()).collect::<Vec<_>>(),
            vec!["code-000", "code-001", "code-002"]
        );

        // An empty buffer never produces a batch.
        time::sleep(INTERVAL * 3).await;
        assert!(h.batches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn size_flush_restarts_the_timer() {
        let mut h = harness(2);

        time::sleep(INTERVAL - Duration::from_secs(1)).await;
        for n in 0..3 {
            h.entries.send(entry(n)).await.unwrap();
        }
        let first = h.batches.recv().await.unwrap();
        assert_eq!(first.len(), 2);

        // The leftover entry waits a full period from the size flush.
        let flushed_at = Instant::now();
        let second = h.batches.recv().await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(flushed_at.elapsed() >= INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_queued_entries() {
        let mut h = harness(5);

        for n in 0..7 {
            h.entries.send(entry(n)).await.unwrap();
        }
        h.shutdown.cancel();
        h.handle.await.unwrap();

        let mut sizes = Vec::new();
        while let Some(batch) = h.batches.recv().await {
            sizes.push(batch.len());
        }
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().all(|size| *size <= 5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_with_empty_buffer_closes_batch_queue() {
        let mut h = harness(5);

        h.shutdown.cancel();
        h.handle.await.unwrap();

        assert!(h.batches.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_intake_stops_the_aggregator() {
        let Harness {
            entries,
            mut batches,
            handle,
            ..
        } = harness(5);

        entries.send(entry(0)).await.unwrap();
        drop(entries);
        handle.await.unwrap();

        assert_eq!(batches.recv().await.unwrap().len(), 1);
        assert!(batches.recv().await.is_none());
    }
}
