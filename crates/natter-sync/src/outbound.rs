use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use natter_remote::RemoteCollection;
use natter_types::api::{AppendReceipt, NewMessage};

use crate::engine::EngineShared;
use crate::error::SendError;

/// One enqueued send, travelling from `send()` to the worker.
pub(crate) struct QueuedSend {
    pub seq: u64,
    pub message: NewMessage,
    pub done: oneshot::Sender<Result<AppendReceipt, SendError>>,
}

/// Completion handle for one `send()`.
///
/// Await [`wait`] to learn the outcome, or drop the ticket for
/// fire-and-forget; the send proceeds either way.
///
/// [`wait`]: SendTicket::wait
#[derive(Debug)]
pub struct SendTicket {
    seq: u64,
    done: oneshot::Receiver<Result<AppendReceipt, SendError>>,
}

impl SendTicket {
    pub(crate) fn new(
        seq: u64,
        done: oneshot::Receiver<Result<AppendReceipt, SendError>>,
    ) -> Self {
        Self { seq, done }
    }

    /// Submission order of this send within its engine.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn wait(self) -> Result<AppendReceipt, SendError> {
        match self.done.await {
            Ok(result) => result,
            // Worker gone without resolving: the engine was torn down.
            Err(_) => Err(SendError::Detached),
        }
    }
}

/// Drains the outbound queue, one append at a time.
///
/// A single worker awaiting each append before taking the next is what
/// makes sends FIFO per client. Failures resolve the ticket and drop the
/// pending entry; nothing is retried here.
pub(crate) async fn run_worker(
    shared: Arc<EngineShared>,
    remote: Arc<dyn RemoteCollection>,
    mut queue: mpsc::UnboundedReceiver<QueuedSend>,
) {
    while let Some(item) = queue.recv().await {
        if shared.is_detached() {
            // Queued before detach, never started: resolve rather than
            // silently dropping the ticket.
            let _ = item.done.send(Err(SendError::Detached));
            continue;
        }

        match remote.append(shared.conversation(), item.message).await {
            Ok(receipt) => {
                debug!(
                    "Send {} on {} confirmed as {}",
                    item.seq,
                    shared.conversation(),
                    receipt.id
                );
                shared.confirm_pending(item.seq, &receipt.id);
                let _ = item.done.send(Ok(receipt));
            }
            Err(e) => {
                warn!("Send {} on {} failed: {}", item.seq, shared.conversation(), e);
                shared.drop_pending(item.seq);
                let _ = item.done.send(Err(SendError::Failed(e.to_string())));
            }
        }
    }

    debug!("Outbound queue for {} closed", shared.conversation());
}
