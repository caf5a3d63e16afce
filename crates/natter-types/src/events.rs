use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::ConversationSnapshot;

/// What a change-stream subscription delivers.
///
/// The stream never sends deltas: every `Snapshot` is the full current
/// ordered state and entirely replaces the previous one. Delivery is
/// at-least-once per logical change, so consumers must treat a repeated
/// identical snapshot as a no-op.
#[derive(Debug, Clone)]
pub enum RemoteNotification {
    /// The full current ordered state of the conversation.
    Snapshot(ConversationSnapshot),
    /// The stream hit a problem. The previously delivered state remains
    /// valid; the stream keeps retrying underneath and will deliver again.
    Error(StreamError),
}

/// Non-fatal subscription failure. Logged by consumers, never shown as an
/// empty conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub message: String,
}

impl StreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
