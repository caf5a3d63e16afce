use thiserror::Error;

/// Why a `send()` did not reach the remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The engine was already torn down. A caller bug: nothing should
    /// hold an engine past its screen's lifetime.
    #[error("Engine is detached")]
    Detached,

    /// Nobody is signed in, so there is no sender name to stamp the
    /// message with.
    #[error("Not signed in")]
    NotAuthenticated,

    /// The remote append failed or the payload was unsendable. The one
    /// variant worth showing to the user; retrying is their call.
    #[error("Send failed: {0}")]
    Failed(String),
}
