use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use natter_types::api::{AppendReceipt, NewMessage};
use natter_types::events::{RemoteNotification, StreamError};
use natter_types::models::{ConversationSnapshot, Message, OrderingKey, Timestamp};

use crate::collection::{AppendError, RemoteCollection, SubscriptionHandle};

/// In-process collection backend.
///
/// Canonical message log plus a per-conversation subscriber registry,
/// all behind one shared inner. Fan-out happens under the registry lock
/// and unsubscribe removes the sender under that same lock, which is
/// what makes the "nothing after unsubscribe returns" guarantee hold.
///
/// Tests drive failure modes through [`set_fail_appends`],
/// [`emit_error`] and [`emit_current`].
///
/// [`set_fail_appends`]: MemoryCollection::set_fail_appends
/// [`emit_error`]: MemoryCollection::emit_error
/// [`emit_current`]: MemoryCollection::emit_current
#[derive(Clone, Default)]
pub struct MemoryCollection {
    inner: Arc<CollectionInner>,
}

#[derive(Default)]
struct CollectionInner {
    /// conversation -> messages in append order
    conversations: Mutex<HashMap<String, Vec<Message>>>,

    /// conversation -> (subscription id -> sender)
    subscribers: Mutex<HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<RemoteNotification>>>>,

    /// While set, appends fail with `Unavailable`.
    fail_appends: AtomicBool,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away. Appends fail until cleared;
    /// existing subscriptions are untouched.
    pub fn set_fail_appends(&self, fail: bool) {
        self.inner.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Push a stream error to every subscriber of `conversation`.
    pub fn emit_error(&self, conversation: &str, message: &str) {
        self.fanout(
            conversation,
            RemoteNotification::Error(StreamError::new(message)),
        );
    }

    /// Re-deliver the current snapshot to every subscriber of
    /// `conversation`, exactly as an at-least-once backend would after a
    /// reconnect. No messages change.
    pub fn emit_current(&self, conversation: &str) {
        let snapshot = self.snapshot(conversation);
        self.fanout(conversation, RemoteNotification::Snapshot(snapshot));
    }

    /// Current ordered state of `conversation`.
    pub fn snapshot(&self, conversation: &str) -> ConversationSnapshot {
        let conversations = self
            .inner
            .conversations
            .lock()
            .expect("conversation lock poisoned");
        match conversations.get(conversation) {
            Some(messages) => ConversationSnapshot::new(messages.clone()),
            None => ConversationSnapshot::empty(),
        }
    }

    /// Number of live subscriptions on `conversation`.
    pub fn subscriber_count(&self, conversation: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .get(conversation)
            .map_or(0, |senders| senders.len())
    }

    fn fanout(&self, conversation: &str, notification: RemoteNotification) {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("subscriber lock poisoned");
        if let Some(senders) = subscribers.get(conversation) {
            for tx in senders.values() {
                let _ = tx.send(notification.clone());
            }
        }
    }
}

#[async_trait]
impl RemoteCollection for MemoryCollection {
    async fn append(
        &self,
        conversation: &str,
        message: NewMessage,
    ) -> Result<AppendReceipt, AppendError> {
        if self.inner.fail_appends.load(Ordering::SeqCst) {
            return Err(AppendError::Unavailable {
                reason: "collection offline".to_string(),
            });
        }

        if message.text.is_none() && message.image.is_none() {
            return Err(AppendError::Rejected {
                reason: "message has no content".to_string(),
            });
        }

        let receipt = AppendReceipt {
            id: Uuid::new_v4().to_string(),
            created_at: Timestamp::now(),
        };

        // Snapshot is built and fanned out under the conversation lock so
        // two racing appends cannot deliver their snapshots out of order.
        let mut conversations =
            self.inner
                .conversations
                .lock()
                .map_err(|e| AppendError::Unavailable {
                    reason: format!("conversation lock poisoned: {}", e),
                })?;

        let log = conversations.entry(conversation.to_string()).or_default();
        log.push(Message {
            id: receipt.id.clone(),
            sender: message.sender,
            text: message.text,
            image: message.image,
            created_at: Some(receipt.created_at),
        });
        let snapshot = ConversationSnapshot::new(log.clone());

        debug!(
            "Appended {} to {} ({} total)",
            receipt.id,
            conversation,
            log.len()
        );
        self.fanout(conversation, RemoteNotification::Snapshot(snapshot));

        Ok(receipt)
    }

    async fn subscribe(
        &self,
        conversation: &str,
        _ordering: OrderingKey,
    ) -> (
        SubscriptionHandle,
        mpsc::UnboundedReceiver<RemoteNotification>,
    ) {
        let sub_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        // Registration and the initial delivery happen under the same
        // locks an append fans out under, so the first notification on
        // this stream is never older than one a concurrent append sent.
        {
            let conversations = self
                .inner
                .conversations
                .lock()
                .expect("conversation lock poisoned");
            let snapshot = match conversations.get(conversation) {
                Some(messages) => ConversationSnapshot::new(messages.clone()),
                None => ConversationSnapshot::empty(),
            };

            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .expect("subscriber lock poisoned");
            subscribers
                .entry(conversation.to_string())
                .or_default()
                .insert(sub_id, tx.clone());

            let _ = tx.send(RemoteNotification::Snapshot(snapshot));
        }

        debug!("Subscription {} opened on {}", sub_id, conversation);

        let inner = self.inner.clone();
        let conversation = conversation.to_string();
        let handle = SubscriptionHandle::new(move || {
            let mut subscribers = inner.subscribers.lock().expect("subscriber lock poisoned");
            if let Some(senders) = subscribers.get_mut(&conversation) {
                senders.remove(&sub_id);
                if senders.is_empty() {
                    subscribers.remove(&conversation);
                }
            }
            debug!("Subscription {} closed on {}", sub_id, conversation);
        });

        (handle, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natter_types::api::OutboundPayload;

    fn text_message(sender: &str, text: &str) -> NewMessage {
        NewMessage::from_payload(sender, OutboundPayload::Text(text.to_string()))
    }

    async fn expect_snapshot(
        rx: &mut mpsc::UnboundedReceiver<RemoteNotification>,
    ) -> ConversationSnapshot {
        match rx.recv().await {
            Some(RemoteNotification::Snapshot(s)) => s,
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn append_assigns_id_and_timestamp() {
        let remote = MemoryCollection::new();
        let receipt = remote
            .append("general", text_message("ana", "hi"))
            .await
            .unwrap();

        assert!(!receipt.id.is_empty());
        let stored = remote.snapshot("general");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.messages()[0].id, receipt.id);
        assert_eq!(stored.messages()[0].created_at, Some(receipt.created_at));
    }

    #[tokio::test]
    async fn subscribe_delivers_current_state_first() {
        let remote = MemoryCollection::new();
        remote
            .append("general", text_message("ana", "before"))
            .await
            .unwrap();

        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        let first = expect_snapshot(&mut rx).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first.messages()[0].text.as_deref(), Some("before"));
    }

    #[tokio::test]
    async fn each_append_fans_out_the_full_state() {
        let remote = MemoryCollection::new();
        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        assert!(expect_snapshot(&mut rx).await.is_empty());

        remote
            .append("general", text_message("ana", "one"))
            .await
            .unwrap();
        remote
            .append("general", text_message("bo", "two"))
            .await
            .unwrap();

        assert_eq!(expect_snapshot(&mut rx).await.len(), 1);
        let second = expect_snapshot(&mut rx).await;
        assert_eq!(second.len(), 2);
        assert_eq!(second.messages()[1].text.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn unsubscribe_silences_the_stream() {
        let remote = MemoryCollection::new();
        let (handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        let _ = expect_snapshot(&mut rx).await;

        handle.unsubscribe();
        assert_eq!(remote.subscriber_count("general"), 0);

        remote
            .append("general", text_message("ana", "after"))
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_handle_unsubscribes() {
        let remote = MemoryCollection::new();
        let (handle, _rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        assert_eq!(remote.subscriber_count("general"), 1);
        drop(handle);
        assert_eq!(remote.subscriber_count("general"), 0);
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let remote = MemoryCollection::new();
        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        let _ = expect_snapshot(&mut rx).await;

        remote
            .append("random", text_message("ana", "elsewhere"))
            .await
            .unwrap();

        remote.emit_current("general");
        assert!(expect_snapshot(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn failed_appends_store_nothing() {
        let remote = MemoryCollection::new();
        remote.set_fail_appends(true);

        let err = remote
            .append("general", text_message("ana", "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppendError::Unavailable { .. }));
        assert!(remote.snapshot("general").is_empty());

        remote.set_fail_appends(false);
        remote
            .append("general", text_message("ana", "kept"))
            .await
            .unwrap();
        assert_eq!(remote.snapshot("general").len(), 1);
    }

    #[tokio::test]
    async fn empty_messages_are_rejected() {
        let remote = MemoryCollection::new();
        let err = remote
            .append(
                "general",
                NewMessage {
                    sender: "ana".to_string(),
                    text: None,
                    image: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppendError::Rejected { .. }));
    }

    #[tokio::test]
    async fn emit_current_duplicates_the_last_snapshot() {
        let remote = MemoryCollection::new();
        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        let _ = expect_snapshot(&mut rx).await;

        remote
            .append("general", text_message("ana", "hi"))
            .await
            .unwrap();
        let first = expect_snapshot(&mut rx).await;

        remote.emit_current("general");
        let duplicate = expect_snapshot(&mut rx).await;
        assert_eq!(first, duplicate);
    }

    #[tokio::test]
    async fn emit_error_reaches_subscribers() {
        let remote = MemoryCollection::new();
        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        let _ = expect_snapshot(&mut rx).await;

        remote.emit_error("general", "stream reset");
        match rx.recv().await {
            Some(RemoteNotification::Error(e)) => assert_eq!(e.message, "stream reset"),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
