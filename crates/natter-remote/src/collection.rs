use async_trait::async_trait;
use natter_types::api::{AppendReceipt, NewMessage};
use natter_types::events::RemoteNotification;
use natter_types::models::OrderingKey;
use thiserror::Error;
use tokio::sync::mpsc;

/// Why an append did not land.
#[derive(Debug, Clone, Error)]
pub enum AppendError {
    /// The backend refused the message. Retrying the same payload will
    /// not succeed.
    #[error("Append rejected: {reason}")]
    Rejected { reason: String },

    /// Transient failure (backend down, out of space). The same payload
    /// may succeed later.
    #[error("Collection unavailable: {reason}")]
    Unavailable { reason: String },
}

/// A remote, append-only message collection with change streams.
///
/// The server owns everything that makes a message real: `append` hands
/// over a [`NewMessage`] without id or timestamp and gets back the
/// server-assigned [`AppendReceipt`]. Subscriptions deliver the full
/// current state of a conversation, never deltas, starting with one
/// snapshot of whatever is there at subscribe time.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Append one message. The backend assigns the id and timestamp.
    async fn append(
        &self,
        conversation: &str,
        message: NewMessage,
    ) -> Result<AppendReceipt, AppendError>;

    /// Open a change stream over `conversation`, ordered by `ordering`.
    ///
    /// The first notification is the current state. Subscription problems
    /// arrive as [`RemoteNotification::Error`] on the stream itself, so
    /// this call has no failure mode of its own.
    async fn subscribe(
        &self,
        conversation: &str,
        ordering: OrderingKey,
    ) -> (
        SubscriptionHandle,
        mpsc::UnboundedReceiver<RemoteNotification>,
    );
}

/// Detaches a change stream.
///
/// The guarantee callers rely on: once `unsubscribe` returns, nothing is
/// delivered on the paired receiver anymore. Backends enforce it by
/// removing their sender under the same lock they send under. Dropping
/// the handle unsubscribes too.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
