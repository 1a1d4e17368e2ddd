//! Storage abstraction and backends.
//!
//! The [`ClaimStore`] and [`RecordStore`] traits are the only surface the engine talks to. The
//! in-memory backend is always available; durable backends are behind the
//! `persistent` and `sqlite` features.

mod memory;
mod table;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryClaimStore, InMemoryRecordStore};
pub use traits::{
    BulkOutcome, BulkUpdate, ClaimStore, PhantomReads, RecordStore, ResolveScope, StorageError,
};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentStores};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStores;
