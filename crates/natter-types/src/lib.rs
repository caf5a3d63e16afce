//! Natter core data model: messages, conversation snapshots, and the
//! draft/receipt shapes exchanged with the remote store.
//!
//! Kept free of I/O so the cache, the remote backends, the sync engine and
//! any UI glue share one vocabulary without dragging each other's
//! dependencies in.

pub mod api;
pub mod events;
pub mod models;
