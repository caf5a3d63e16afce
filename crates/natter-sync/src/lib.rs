//! The synchronization engine: keeps one conversation's local view
//! consistent with the remote collection while staying usable offline.
//!
//! Startup publishes whatever the cache holds so the screen renders
//! before the network answers, then the live stream takes over. Remote
//! snapshots are authoritative and arrive whole; the engine reconciles
//! nothing, it republishes, persists, and moves on. Outbound sends go
//! through a FIFO queue and become visible only once the remote echoes
//! them back in a snapshot.

mod engine;
mod error;
mod outbound;

pub use engine::{EngineState, SyncEngine, SyncEngineConfig};
pub use error::SendError;
pub use outbound::SendTicket;
