//! Remote side of the chat: the append-only message collection, its
//! change-stream subscriptions, blob storage for image uploads, and the
//! identity provider.
//!
//! Everything here sits behind traits so the sync engine never knows which
//! backend it is talking to. Two backends ship: [`MemoryCollection`] for
//! tests and single-process demos, and [`SqliteCollection`], which polls a
//! shared database file so two processes on one machine can chat.

pub mod auth;
pub mod blob;
pub mod collection;
pub mod memory;
pub mod sqlite;

pub use auth::{AuthProvider, StaticAuth};
pub use blob::{BlobStore, DirBlobStore, MemoryBlobStore, encode_image};
pub use collection::{AppendError, RemoteCollection, SubscriptionHandle};
pub use memory::MemoryCollection;
pub use sqlite::SqliteCollection;
