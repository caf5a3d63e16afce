use serde::{Deserialize, Serialize};

use crate::models::{ImagePayload, Timestamp};

/// What a caller hands to `send()`: a message body in draft form. The
/// remote store supplies identity and creation time later, so drafts carry
/// neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text(String),
    Image(ImagePayload),
}

impl OutboundPayload {
    /// A draft with nothing in it can never become a Message (every Message
    /// carries text or an image), so `send()` rejects it up front.
    pub fn is_empty(&self) -> bool {
        match self {
            OutboundPayload::Text(text) => text.trim().is_empty(),
            OutboundPayload::Image(_) => false,
        }
    }
}

/// A record to append, before the remote store has assigned an id and a
/// creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender: String,
    pub text: Option<String>,
    pub image: Option<ImagePayload>,
}

impl NewMessage {
    pub fn from_payload(sender: &str, payload: OutboundPayload) -> Self {
        let (text, image) = match payload {
            OutboundPayload::Text(text) => (Some(text), None),
            OutboundPayload::Image(image) => (None, Some(image)),
        };
        Self {
            sender: sender.to_string(),
            text,
            image,
        }
    }
}

/// Remote-assigned identity for a successfully appended record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub id: String,
    pub created_at: Timestamp,
}

/// A locally authored message awaiting its echo from the remote store.
///
/// Lives only in memory: created by `send()`, gone once a published
/// snapshot contains the confirmed id or the send fails. A crash loses
/// whatever was still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    /// Local submission order, unique within one engine.
    pub seq: u64,
    pub sender: String,
    pub payload: OutboundPayload,
    /// Set once the remote append returned its receipt.
    pub confirmed_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_drafts_are_empty() {
        assert!(OutboundPayload::Text("   ".to_string()).is_empty());
        assert!(!OutboundPayload::Text("hi".to_string()).is_empty());
        assert!(!OutboundPayload::Image(ImagePayload::Url("u".to_string())).is_empty());
    }

    #[test]
    fn draft_to_new_message() {
        let text = NewMessage::from_payload("alice", OutboundPayload::Text("hi".to_string()));
        assert_eq!(text.sender, "alice");
        assert_eq!(text.text.as_deref(), Some("hi"));
        assert!(text.image.is_none());

        let image = NewMessage::from_payload(
            "bob",
            OutboundPayload::Image(ImagePayload::Inline("aGk=".to_string())),
        );
        assert!(image.text.is_none());
        assert!(image.image.is_some());
    }
}
