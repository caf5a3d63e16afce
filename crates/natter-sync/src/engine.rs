use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use natter_cache::{KvStore, MessageCache};
use natter_remote::{AuthProvider, RemoteCollection, SubscriptionHandle};
use natter_types::api::{NewMessage, OutboundPayload, PendingSend};
use natter_types::events::RemoteNotification;
use natter_types::models::{ConversationSnapshot, OrderingKey};

use crate::error::SendError;
use crate::outbound::{QueuedSend, SendTicket, run_worker};

/// Where the engine is in its lifecycle.
///
/// `Hydrating` covers the span from spawn until the stream's first
/// snapshot; the published conversation during it comes from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Hydrating,
    Live,
    Detached,
}

/// Everything an engine needs, handed in explicitly so tests can
/// substitute any backend.
pub struct SyncEngineConfig {
    pub conversation: String,
    pub kv: Arc<dyn KvStore>,
    pub remote: Arc<dyn RemoteCollection>,
    pub auth: Arc<dyn AuthProvider>,
}

/// Orchestrates one conversation: cache hydration, the live snapshot
/// stream, persistence, and the outbound send queue.
///
/// Published state goes out on `watch` channels, so consumers always read
/// the current value and slow consumers skip intermediates instead of
/// queueing them. The published snapshot itself is never touched by
/// sends; a message appears only once the remote echoes it back.
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    auth: Arc<dyn AuthProvider>,
    snapshots: watch::Receiver<ConversationSnapshot>,
    states: watch::Receiver<EngineState>,
    pending: watch::Receiver<Vec<PendingSend>>,
    next_seq: AtomicU64,
}

/// State the engine's tasks publish through. Held behind one mutex slot
/// so detach can take the senders out; after that, no task can publish.
pub(crate) struct Publishers {
    snapshots: watch::Sender<ConversationSnapshot>,
    states: watch::Sender<EngineState>,
    pending: watch::Sender<Vec<PendingSend>>,
    /// Latest-value slot feeding the persister task.
    persist: watch::Sender<Option<ConversationSnapshot>>,
}

pub(crate) struct EngineShared {
    conversation: String,
    publishers: Mutex<Option<Publishers>>,
    sub_handle: Mutex<Option<SubscriptionHandle>>,
    queue: Mutex<Option<mpsc::UnboundedSender<QueuedSend>>>,
    /// Set on the first remote snapshot; late hydration checks it so
    /// cached state never overwrites fresher remote state.
    remote_seen: AtomicBool,
    detached: AtomicBool,
}

impl EngineShared {
    pub(crate) fn conversation(&self) -> &str {
        &self.conversation
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Apply one authoritative snapshot from the stream.
    fn apply_remote(&self, snapshot: ConversationSnapshot) {
        let guard = self.publishers.lock().expect("publisher lock poisoned");
        let Some(p) = guard.as_ref() else { return };

        self.remote_seen.store(true, Ordering::SeqCst);

        p.states.send_if_modified(|state| match state {
            EngineState::Hydrating => {
                *state = EngineState::Live;
                true
            }
            _ => false,
        });

        // Confirmed sends the snapshot now carries have completed their
        // round trip; drop them from the pending feed.
        p.pending.send_if_modified(|pending| {
            let before = pending.len();
            pending.retain(|entry| match &entry.confirmed_id {
                Some(id) => !snapshot.contains_id(id),
                None => true,
            });
            pending.len() != before
        });

        // Persistence is decoupled from publication: the slot conflates
        // bursts to the newest snapshot, so a slow cache write delays
        // nothing and each notification costs at most one write.
        let _ = p.persist.send(Some(snapshot.clone()));

        p.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    /// Publish the cache's snapshot, unless the stream got here first.
    fn apply_hydrated(&self, snapshot: ConversationSnapshot) {
        let guard = self.publishers.lock().expect("publisher lock poisoned");
        let Some(p) = guard.as_ref() else { return };

        if self.remote_seen.load(Ordering::SeqCst) {
            debug!(
                "Discarding cached history for {}: stream is already live",
                self.conversation
            );
            return;
        }

        p.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn push_pending(&self, entry: PendingSend) {
        let guard = self.publishers.lock().expect("publisher lock poisoned");
        let Some(p) = guard.as_ref() else { return };
        p.pending.send_modify(|pending| pending.push(entry));
    }

    /// Record the receipt for a pending send. If a snapshot carrying the
    /// id already got published while the append was in flight, the entry
    /// is done and goes away here instead.
    pub(crate) fn confirm_pending(&self, seq: u64, id: &str) {
        let guard = self.publishers.lock().expect("publisher lock poisoned");
        let Some(p) = guard.as_ref() else { return };

        let already_published = p.snapshots.borrow().contains_id(id);
        p.pending.send_if_modified(|pending| {
            if already_published {
                let before = pending.len();
                pending.retain(|entry| entry.seq != seq);
                pending.len() != before
            } else {
                match pending.iter_mut().find(|entry| entry.seq == seq) {
                    Some(entry) => {
                        entry.confirmed_id = Some(id.to_string());
                        true
                    }
                    None => false,
                }
            }
        });
    }

    pub(crate) fn drop_pending(&self, seq: u64) {
        let guard = self.publishers.lock().expect("publisher lock poisoned");
        let Some(p) = guard.as_ref() else { return };
        p.pending.send_if_modified(|pending| {
            let before = pending.len();
            pending.retain(|entry| entry.seq != seq);
            pending.len() != before
        });
    }
}

impl SyncEngine {
    /// Start syncing `config.conversation`. Must be called on a Tokio
    /// runtime; hydration, subscription, persistence and the outbound
    /// queue each run as their own task.
    pub fn spawn(config: SyncEngineConfig) -> Self {
        let SyncEngineConfig {
            conversation,
            kv,
            remote,
            auth,
        } = config;

        let (snapshots_tx, snapshots_rx) = watch::channel(ConversationSnapshot::empty());
        let (states_tx, states_rx) = watch::channel(EngineState::Hydrating);
        let (pending_tx, pending_rx) = watch::channel(Vec::new());
        let (persist_tx, mut persist_rx) = watch::channel(None);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(EngineShared {
            conversation: conversation.clone(),
            publishers: Mutex::new(Some(Publishers {
                snapshots: snapshots_tx,
                states: states_tx,
                pending: pending_tx,
                persist: persist_tx,
            })),
            sub_handle: Mutex::new(None),
            queue: Mutex::new(Some(queue_tx)),
            remote_seen: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        });

        info!("Engine starting for {}", conversation);

        let cache = Arc::new(MessageCache::new(kv, &conversation));

        // Hydration: one shot, so the screen has something before the
        // network answers.
        let hydrate_cache = cache.clone();
        let hydrate_shared = shared.clone();
        tokio::spawn(async move {
            let snapshot = hydrate_cache.load().await;
            hydrate_shared.apply_hydrated(snapshot);
        });

        // Subscription: long lived, applies notifications in receipt
        // order until the stream ends or detach cancels it.
        let sub_shared = shared.clone();
        let sub_remote = remote.clone();
        tokio::spawn(async move {
            if sub_shared.is_detached() {
                return;
            }

            let (handle, mut notifications) = sub_remote
                .subscribe(&sub_shared.conversation, OrderingKey::CreatedAtAsc)
                .await;

            *sub_shared.sub_handle.lock().expect("handle lock poisoned") = Some(handle);
            if sub_shared.is_detached() {
                // Detach won the race; it missed the handle, so close it.
                let taken = sub_shared
                    .sub_handle
                    .lock()
                    .expect("handle lock poisoned")
                    .take();
                if let Some(handle) = taken {
                    handle.unsubscribe();
                }
                return;
            }

            while let Some(notification) = notifications.recv().await {
                match notification {
                    RemoteNotification::Snapshot(snapshot) => sub_shared.apply_remote(snapshot),
                    RemoteNotification::Error(e) => {
                        // Last good state stays up; the stream retries
                        // underneath and will deliver again.
                        warn!("Stream error on {}: {}", sub_shared.conversation, e);
                    }
                }
            }
            debug!("Notification stream for {} ended", sub_shared.conversation);
        });

        // Persister: consumes the latest-value slot, never the stream
        // itself, so it can lag without holding anything up.
        let persist_conversation = conversation.clone();
        tokio::spawn(async move {
            while persist_rx.changed().await.is_ok() {
                let snapshot = persist_rx.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    if let Err(e) = cache.save(&snapshot).await {
                        warn!("Cache write for {} failed: {:#}", persist_conversation, e);
                    }
                }
            }
        });

        tokio::spawn(run_worker(shared.clone(), remote, queue_rx));

        Self {
            shared,
            auth,
            snapshots: snapshots_rx,
            states: states_rx,
            pending: pending_rx,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Stream of the published conversation. The first value is empty
    /// until hydration lands.
    pub fn snapshots(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshots.clone()
    }

    pub fn states(&self) -> watch::Receiver<EngineState> {
        self.states.clone()
    }

    /// Locally authored sends still waiting for their remote echo. Kept
    /// apart from the published snapshot on purpose.
    pub fn pending(&self) -> watch::Receiver<Vec<PendingSend>> {
        self.pending.clone()
    }

    /// Enqueue one message. Returns as soon as the send is queued; the
    /// ticket reports the outcome to whoever cares to await it.
    pub fn send(&self, payload: OutboundPayload) -> Result<SendTicket, SendError> {
        if self.shared.is_detached() {
            return Err(SendError::Detached);
        }

        let identity = self
            .auth
            .current_identity()
            .ok_or(SendError::NotAuthenticated)?;

        if payload.is_empty() {
            return Err(SendError::Failed("message has no content".to_string()));
        }

        let queue = {
            let guard = self.shared.queue.lock().expect("queue lock poisoned");
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(SendError::Detached),
            }
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let message = NewMessage::from_payload(&identity.display_name, payload.clone());
        let (done_tx, done_rx) = oneshot::channel();

        self.shared.push_pending(PendingSend {
            seq,
            sender: identity.display_name,
            payload,
            confirmed_id: None,
        });

        if queue
            .send(QueuedSend {
                seq,
                message,
                done: done_tx,
            })
            .is_err()
        {
            self.shared.drop_pending(seq);
            return Err(SendError::Detached);
        }

        debug!("Queued send {} on {}", seq, self.shared.conversation);
        Ok(SendTicket::new(seq, done_rx))
    }

    /// Tear down. Idempotent. Once this returns nothing is published
    /// anymore, no notification is delivered, and `send()` refuses.
    pub fn detach(&self) {
        if self.shared.detached.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Engine detaching from {}", self.shared.conversation);

        // Publishers go first: with the slot empty, every publish path
        // is a no-op before the subscription is even torn down.
        let publishers = self
            .shared
            .publishers
            .lock()
            .expect("publisher lock poisoned")
            .take();
        if let Some(p) = publishers {
            let _ = p.states.send(EngineState::Detached);
            // Senders drop here; the persister's slot closes with them.
        }

        let handle = self
            .shared
            .sub_handle
            .lock()
            .expect("handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.unsubscribe();
        }

        // Closing the queue lets the worker drain and exit; anything not
        // yet started resolves as Detached.
        self.shared.queue.lock().expect("queue lock poisoned").take();
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natter_cache::MemoryKv;
    use natter_remote::{MemoryCollection, StaticAuth};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn engine_with(remote: MemoryCollection, auth: StaticAuth) -> (SyncEngine, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let engine = SyncEngine::spawn(SyncEngineConfig {
            conversation: "general".to_string(),
            kv: kv.clone(),
            remote: Arc::new(remote),
            auth: Arc::new(auth),
        });
        (engine, kv)
    }

    #[tokio::test]
    async fn first_snapshot_flips_hydrating_to_live() {
        let (engine, _kv) =
            engine_with(MemoryCollection::new(), StaticAuth::signed_in("u1", "Ana"));

        let mut states = engine.states();
        timeout(WAIT, states.wait_for(|s| *s == EngineState::Live))
            .await
            .expect("never went live")
            .unwrap();
    }

    #[tokio::test]
    async fn detach_publishes_detached_and_is_idempotent() {
        let (engine, _kv) =
            engine_with(MemoryCollection::new(), StaticAuth::signed_in("u1", "Ana"));

        let states = engine.states();
        engine.detach();
        engine.detach();
        assert_eq!(*states.borrow(), EngineState::Detached);
    }

    #[tokio::test]
    async fn send_after_detach_is_refused() {
        let (engine, _kv) =
            engine_with(MemoryCollection::new(), StaticAuth::signed_in("u1", "Ana"));
        engine.detach();

        let err = engine
            .send(OutboundPayload::Text("hi".to_string()))
            .unwrap_err();
        assert_eq!(err, SendError::Detached);
    }

    #[tokio::test]
    async fn send_without_identity_is_refused() {
        let (engine, _kv) = engine_with(MemoryCollection::new(), StaticAuth::signed_out());

        let err = engine
            .send(OutboundPayload::Text("hi".to_string()))
            .unwrap_err();
        assert_eq!(err, SendError::NotAuthenticated);
    }

    #[tokio::test]
    async fn blank_text_is_refused_before_queueing() {
        let (engine, _kv) =
            engine_with(MemoryCollection::new(), StaticAuth::signed_in("u1", "Ana"));

        let err = engine
            .send(OutboundPayload::Text("   ".to_string()))
            .unwrap_err();
        assert!(matches!(err, SendError::Failed(_)));
        assert!(engine.pending().borrow().is_empty());
    }

    #[tokio::test]
    async fn successful_send_lands_in_the_snapshot() {
        let (engine, _kv) =
            engine_with(MemoryCollection::new(), StaticAuth::signed_in("u1", "Ana"));

        let ticket = engine.send(OutboundPayload::Text("hi".to_string())).unwrap();
        let receipt = timeout(WAIT, ticket.wait()).await.unwrap().unwrap();

        let mut snapshots = engine.snapshots();
        let seen = timeout(WAIT, snapshots.wait_for(|s| s.contains_id(&receipt.id)))
            .await
            .expect("send never echoed")
            .unwrap();
        assert_eq!(seen.messages()[0].sender, "Ana");
    }
}
