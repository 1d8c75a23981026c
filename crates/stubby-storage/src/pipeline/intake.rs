use crate::pipeline::DeleteEntry;
use stubby_core::error::{Result, StorageError};
use stubby_core::{ShortCode, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Entry point for deletion requests coming from request handlers.
///
/// Cloning is cheap; every clone feeds the same aggregator.
#[derive(Debug, Clone)]
pub struct DeleteIntake {
    sender: mpsc::Sender<DeleteEntry>,
    shutdown: CancellationToken,
}

impl DeleteIntake {
    pub(crate) fn new(sender: mpsc::Sender<DeleteEntry>, shutdown: CancellationToken) -> Self {
        Self { sender, shutdown }
    }

    /// Hands one deletion request to the aggregator.
    ///
    /// Performs no I/O. The intake queue is bounded, so when the aggregator
    /// falls behind this suspends the caller until a slot frees up. Once
    /// shutdown has started the request is refused with `Closed`; a request
    /// accepted here is always part of a later batch.
    pub async fn enqueue(&self, user_id: UserId, code: ShortCode) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(closed());
        }

        trace!(user_id = %user_id, code = %code, "enqueueing delete request");
        self.sender
            .send(DeleteEntry::new(user_id, code))
            .await
            .map_err(|mpsc::error::SendError(entry)| {
                warn!(
                    user_id = %entry.user_id,
                    code = %entry.code,
                    "delete request refused, pipeline is shut down"
                );
                closed()
            })
    }

    /// Enqueues one request per code, in order.
    pub async fn enqueue_all(&self, user_id: &UserId, codes: &[ShortCode]) -> Result<()> {
        for code in codes {
            self.enqueue(user_id.clone(), code.clone()).await?;
        }
        Ok(())
    }
}

fn closed() -> StorageError {
    StorageError::Closed("delete pipeline is shut down".to_string())
}
