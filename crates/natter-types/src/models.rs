use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Creation time as an epoch seconds/nanoseconds pair, the shape the remote
/// store assigns and the cache persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Utc::now().into()
    }

    /// Back to chrono; `None` if the pair is out of range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, self.nanos)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos(),
        }
    }
}

/// An image attachment in either delivery form: a reference to a blob
/// uploaded out-of-band, or the encoded bytes carried in the record itself.
/// The sync core treats both as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ImagePayload {
    /// URL of an uploaded blob.
    Url(String),
    /// Transport-safe (base64) encoded image data.
    Inline(String),
}

/// A single chat message.
///
/// Immutable once created: the remote store assigns `id` and `created_at`
/// at write time and records are never edited or deleted, so an id
/// designates the same content forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Remote-assigned identifier. Never generated client-side.
    pub id: String,
    /// Sender display name.
    pub sender: String,
    /// Text body. At least one of `text` / `image` is present.
    pub text: Option<String>,
    /// Image attachment.
    pub image: Option<ImagePayload>,
    /// Server-assigned creation time; `None` until the remote store has
    /// resolved it.
    pub created_at: Option<Timestamp>,
}

impl Message {
    /// Canonical message order: creation time ascending, with unresolved
    /// (`None`) timestamps first, ties broken by id ascending.
    ///
    /// `Option`'s own ordering already sorts `None` before `Some`, which is
    /// exactly the backend's null-first behavior on an ascending index.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// True if the message carries a non-empty text body or an image.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty()) || self.image.is_some()
    }
}

/// The full ordered message list for one conversation, as of one point in
/// time. Replaced wholesale on every remote notification, never patched.
///
/// Construction sorts into canonical order, so an out-of-order snapshot
/// value cannot exist in the program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSnapshot {
    messages: Vec<Message>,
}

impl ConversationSnapshot {
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by(Message::canonical_cmp);
        Self { messages }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// The field defining canonical message order for a subscription. Declared
/// at subscribe time so every backend delivers the same order the engine
/// and cache assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderingKey {
    /// Creation time ascending, unresolved times first, id as tie-break.
    CreatedAtAsc,
}

/// The signed-in user as the sync core sees them: an opaque id plus the
/// display name stamped onto outbound messages. Credentials never reach
/// this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub display_name: String,
}
