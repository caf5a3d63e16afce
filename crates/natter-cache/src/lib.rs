//! Durable local cache for conversation snapshots.
//!
//! The cache exists so a chat screen can render instantly on launch and
//! stay readable offline: it always holds the last snapshot this device
//! saw, nothing finer-grained. Reads are deliberately infallible. A
//! missing, corrupt, or out-of-date record loads as an empty conversation
//! and the live stream repopulates it.

pub mod kv;
pub mod store;

pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use store::MessageCache;
