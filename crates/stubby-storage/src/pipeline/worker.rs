use crate::pipeline::{Batch, BatchApplier};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

/// Pulls batches off the shared queue and applies them one at a time.
pub(crate) struct DeleteWorker<A> {
    id: usize,
    batches: Arc<Mutex<mpsc::Receiver<Batch>>>,
    applier: Arc<A>,
}

impl<A: BatchApplier> DeleteWorker<A> {
    pub(crate) fn new(id: usize, batches: Arc<Mutex<mpsc::Receiver<Batch>>>, applier: Arc<A>) -> Self {
        Self {
            id,
            batches,
            applier,
        }
    }

    /// Runs until the batch queue is closed and empty.
    pub(crate) async fn run(self) {
        while let Some(batch) = self.next_batch().await {
            self.process(batch).await;
        }
        debug!(worker = self.id, "batch queue closed, delete worker exiting");
    }

    async fn next_batch(&self) -> Option<Batch> {
        self.batches.lock().await.recv().await
    }

    async fn process(&self, batch: Batch) {
        let groups = batch.group_by_user();

        match self.applier.apply(&groups).await {
            Ok(()) => {
                debug!(
                    worker = self.id,
                    entries = batch.len(),
                    users = groups.len(),
                    "applied delete batch"
                );
            }
            Err(err) => {
                // The caller was already told the deletion was accepted, so a
                // failed batch can only be reported here.
                error!(
                    worker = self.id,
                    entries = batch.len(),
                    users = groups.len(),
                    error = %err,
                    "delete batch rolled back"
                );
            }
        }
    }
}
