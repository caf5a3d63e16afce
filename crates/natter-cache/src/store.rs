use crate::kv::KvStore;
use anyhow::Result;
use natter_types::models::{ConversationSnapshot, Message};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bump when the record layout changes. Older records are discarded on
/// load rather than migrated; the live stream rebuilds them.
const CACHE_SCHEMA_VERSION: u32 = 1;

/// On-disk form of a cached conversation. Private to this module: the
/// rest of the system only ever sees [`ConversationSnapshot`] values.
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    version: u32,
    messages: Vec<Message>,
}

/// Whole-conversation cache over a [`KvStore`].
///
/// One record per conversation, always overwritten in full. There is no
/// per-message bookkeeping here: the record is a copy of the last
/// snapshot the engine published, nothing else.
pub struct MessageCache {
    kv: Arc<dyn KvStore>,
    conversation: String,
    key: String,
}

impl MessageCache {
    pub fn new(kv: Arc<dyn KvStore>, conversation: &str) -> Self {
        Self {
            kv,
            conversation: conversation.to_string(),
            key: format!("chat_history:{}", conversation),
        }
    }

    /// Last snapshot this device saw, or empty.
    ///
    /// Never errors. A missing record, an unreadable store, a corrupt
    /// record, or a record from an older schema all load as an empty
    /// conversation; startup must not be blocked by a broken cache.
    pub async fn load(&self) -> ConversationSnapshot {
        let bytes = match self.kv.get(&self.key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No cached history for {}", self.conversation);
                return ConversationSnapshot::empty();
            }
            Err(e) => {
                warn!("Cache read failed for {}: {:#}", self.conversation, e);
                return ConversationSnapshot::empty();
            }
        };

        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) if record.version == CACHE_SCHEMA_VERSION => {
                debug!(
                    "Loaded {} cached messages for {}",
                    record.messages.len(),
                    self.conversation
                );
                ConversationSnapshot::new(record.messages)
            }
            Ok(record) => {
                warn!(
                    "Discarding cached history for {}: schema v{}, expected v{}",
                    self.conversation, record.version, CACHE_SCHEMA_VERSION
                );
                ConversationSnapshot::empty()
            }
            Err(e) => {
                warn!(
                    "Discarding corrupt cached history for {}: {}",
                    self.conversation, e
                );
                ConversationSnapshot::empty()
            }
        }
    }

    /// Overwrite the cached record with `snapshot`.
    ///
    /// Callers treat a failure as a degraded session, not a fatal one:
    /// log it and keep going, the next successful save repairs the record.
    pub async fn save(&self, snapshot: &ConversationSnapshot) -> Result<()> {
        let record = CacheRecord {
            version: CACHE_SCHEMA_VERSION,
            messages: snapshot.messages().to_vec(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.kv.set(&self.key, bytes).await
    }
}
