use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{Connection, params};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use natter_types::api::{AppendReceipt, NewMessage};
use natter_types::events::{RemoteNotification, StreamError};
use natter_types::models::{ConversationSnapshot, Message, OrderingKey, Timestamp};

use crate::collection::{AppendError, RemoteCollection, SubscriptionHandle};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Collection backend over a shared SQLite file.
///
/// There is no push channel between processes, so subscriptions poll:
/// each one re-reads its conversation on an interval and delivers a
/// snapshot whenever the result differs from the last one it sent. WAL
/// mode keeps readers in other processes live while one process writes,
/// which is what makes the two-terminal demo work.
pub struct SqliteCollection {
    conn: Arc<Mutex<Connection>>,
    poll_interval: Duration,
}

impl SqliteCollection {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_interval(path, DEFAULT_POLL_INTERVAL)
    }

    pub fn open_with_interval(path: &Path, poll_interval: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads across processes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        init_schema(&conn)?;

        info!("Remote collection opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll_interval,
        })
    }
}

#[async_trait]
impl RemoteCollection for SqliteCollection {
    async fn append(
        &self,
        conversation: &str,
        message: NewMessage,
    ) -> Result<AppendReceipt, AppendError> {
        if message.text.is_none() && message.image.is_none() {
            return Err(AppendError::Rejected {
                reason: "message has no content".to_string(),
            });
        }

        let receipt = AppendReceipt {
            id: Uuid::new_v4().to_string(),
            created_at: Timestamp::now(),
        };

        let conn = self.conn.clone();
        let conversation = conversation.to_string();
        let stored = receipt.clone();
        tokio::task::spawn_blocking(move || insert_message(&conn, &conversation, &stored, message))
            .await
            .map_err(|e| AppendError::Unavailable {
                reason: format!("insert task failed: {}", e),
            })?
            .map_err(|e| AppendError::Unavailable {
                reason: format!("{:#}", e),
            })?;

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
        let (tx, rx) = mpsc::unbounded_channel();

        // The poller only ever sends while holding this slot, and
        // unsubscribe empties it under the same lock. Once unsubscribe
        // returns, no notification can be in flight.
        let slot = Arc::new(Mutex::new(Some(tx)));

        let conn = self.conn.clone();
        let poll_slot = slot.clone();
        let conversation = conversation.to_string();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            let mut last: Option<ConversationSnapshot> = None;

            loop {
                // First tick fires immediately: the current state is the
                // first thing a new subscription receives.
                ticker.tick().await;

                {
                    let guard = poll_slot.lock().expect("subscription slot poisoned");
                    match guard.as_ref() {
                        Some(tx) if !tx.is_closed() => {}
                        _ => break,
                    }
                }

                let conn = conn.clone();
                let target = conversation.clone();
                let read =
                    tokio::task::spawn_blocking(move || read_conversation(&conn, &target)).await;

                let notification = match read {
                    Ok(Ok(snapshot)) => {
                        if last.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        last = Some(snapshot.clone());
                        RemoteNotification::Snapshot(snapshot)
                    }
                    Ok(Err(e)) => {
                        warn!("Poll of {} failed: {:#}", conversation, e);
                        // Re-deliver after recovery, even if nothing changed.
                        last = None;
                        RemoteNotification::Error(StreamError::new(e.to_string()))
                    }
                    Err(e) => {
                        warn!("Poll task for {} panicked: {}", conversation, e);
                        last = None;
                        RemoteNotification::Error(StreamError::new(e.to_string()))
                    }
                };

                let guard = poll_slot.lock().expect("subscription slot poisoned");
                match guard.as_ref() {
                    Some(tx) => {
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            debug!("Poller for {} stopped", conversation);
        });

        let handle = SubscriptionHandle::new(move || {
            slot.lock().expect("subscription slot poisoned").take();
        });

        (handle, rx)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation TEXT NOT NULL,
            sender TEXT NOT NULL,
            text TEXT,
            image TEXT,
            created_secs INTEGER NOT NULL,
            created_nanos INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages (conversation, created_secs, created_nanos, id);
        ",
    )?;
    Ok(())
}

fn insert_message(
    conn: &Mutex<Connection>,
    conversation: &str,
    receipt: &AppendReceipt,
    message: NewMessage,
) -> Result<()> {
    let image_json = message
        .image
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let conn = conn
        .lock()
        .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
    conn.execute(
        "INSERT INTO messages (id, conversation, sender, text, image, created_secs, created_nanos)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            receipt.id,
            conversation,
            message.sender,
            message.text,
            image_json,
            receipt.created_at.seconds,
            receipt.created_at.nanos,
        ],
    )?;
    Ok(())
}

fn read_conversation(conn: &Mutex<Connection>, conversation: &str) -> Result<ConversationSnapshot> {
    let conn = conn
        .lock()
        .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
    let mut stmt = conn.prepare_cached(
        "SELECT id, sender, text, image, created_secs, created_nanos
         FROM messages
         WHERE conversation = ?1
         ORDER BY created_secs, created_nanos, id",
    )?;

    let rows = stmt.query_map(params![conversation], |row| {
        let image_json: Option<String> = row.get(3)?;
        let image = match image_json {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            None => None,
        };
        Ok(Message {
            id: row.get(0)?,
            sender: row.get(1)?,
            text: row.get(2)?,
            image,
            created_at: Some(Timestamp::new(row.get(4)?, row.get(5)?)),
        })
    })?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(ConversationSnapshot::new(messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use natter_types::api::OutboundPayload;
    use natter_types::models::ImagePayload;
    use std::path::PathBuf;
    use tokio::time::timeout;

    const FAST_POLL: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(5);

    fn temp_db(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "natter-remote-{}-{}.db",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn text_message(sender: &str, text: &str) -> NewMessage {
        NewMessage::from_payload(sender, OutboundPayload::Text(text.to_string()))
    }

    async fn next_snapshot(
        rx: &mut mpsc::UnboundedReceiver<RemoteNotification>,
    ) -> ConversationSnapshot {
        match timeout(WAIT, rx.recv()).await {
            Ok(Some(RemoteNotification::Snapshot(s))) => s,
            Ok(Some(RemoteNotification::Error(e))) => panic!("stream error: {}", e),
            Ok(None) => panic!("stream closed"),
            Err(_) => panic!("timed out waiting for snapshot"),
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_existing_history_first() {
        let path = temp_db("history");
        let remote = SqliteCollection::open_with_interval(&path, FAST_POLL).unwrap();

        remote
            .append("general", text_message("ana", "one"))
            .await
            .unwrap();
        remote
            .append("general", text_message("bo", "two"))
            .await
            .unwrap();

        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        let first = next_snapshot(&mut rx).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first.messages()[0].text.as_deref(), Some("one"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn appends_reach_live_subscriptions() {
        let path = temp_db("live");
        let remote = SqliteCollection::open_with_interval(&path, FAST_POLL).unwrap();

        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        assert!(next_snapshot(&mut rx).await.is_empty());

        let receipt = remote
            .append("general", text_message("ana", "hello"))
            .await
            .unwrap();

        let updated = next_snapshot(&mut rx).await;
        assert_eq!(updated.len(), 1);
        assert_eq!(updated.messages()[0].id, receipt.id);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn two_handles_on_one_file_see_each_other() {
        let path = temp_db("shared");
        let writer = SqliteCollection::open_with_interval(&path, FAST_POLL).unwrap();
        let reader = SqliteCollection::open_with_interval(&path, FAST_POLL).unwrap();

        let (_handle, mut rx) = reader.subscribe("general", OrderingKey::CreatedAtAsc).await;
        assert!(next_snapshot(&mut rx).await.is_empty());

        writer
            .append("general", text_message("ana", "across handles"))
            .await
            .unwrap();

        let seen = next_snapshot(&mut rx).await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen.messages()[0].text.as_deref(), Some("across handles"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let path = temp_db("unsub");
        let remote = SqliteCollection::open_with_interval(&path, FAST_POLL).unwrap();

        let (handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        assert!(next_snapshot(&mut rx).await.is_empty());

        handle.unsubscribe();
        remote
            .append("general", text_message("ana", "unseen"))
            .await
            .unwrap();

        // Sender was taken out of the slot, so the channel closes once
        // anything buffered is drained.
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn poll_errors_surface_and_delivery_recovers() {
        let path = temp_db("pollerr");
        let remote = SqliteCollection::open_with_interval(&path, FAST_POLL).unwrap();

        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        assert!(next_snapshot(&mut rx).await.is_empty());

        // Break the schema out from under the poller.
        let raw = Connection::open(&path).unwrap();
        raw.busy_timeout(Duration::from_secs(5)).unwrap();
        raw.execute_batch("DROP TABLE messages;").unwrap();

        match timeout(WAIT, rx.recv()).await.unwrap() {
            Some(RemoteNotification::Error(_)) => {}
            other => panic!("expected stream error, got {:?}", other),
        }

        // Restoring the table restores delivery. The current state is
        // re-sent even though nothing changed while it was broken.
        init_schema(&raw).unwrap();
        let recovered = timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Some(RemoteNotification::Snapshot(s)) => break s,
                    Some(RemoteNotification::Error(_)) => continue,
                    None => panic!("stream closed"),
                }
            }
        })
        .await
        .expect("stream never recovered");
        assert!(recovered.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn image_messages_round_trip_through_the_table() {
        let path = temp_db("image");
        let remote = SqliteCollection::open_with_interval(&path, FAST_POLL).unwrap();

        let payload =
            OutboundPayload::Image(ImagePayload::Url("https://cdn.example/pic.png".to_string()));
        remote
            .append("general", NewMessage::from_payload("ana", payload))
            .await
            .unwrap();

        let (_handle, mut rx) = remote.subscribe("general", OrderingKey::CreatedAtAsc).await;
        let seen = next_snapshot(&mut rx).await;
        assert_eq!(
            seen.messages()[0].image,
            Some(ImagePayload::Url("https://cdn.example/pic.png".to_string()))
        );
        assert_eq!(seen.messages()[0].text, None);

        let _ = std::fs::remove_file(&path);
    }
}
