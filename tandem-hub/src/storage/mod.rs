//! Durable storage for session documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  append / full state  ┌────────────────────┐
//! │ PersistenceBridge│ ────────────────────► │ dyn DocumentStorage│
//! │ (per session)    │ ◄──────────────────── │                    │
//! └──────────────────┘        load           └─────────┬──────────┘
//!                                                      │
//!                              ┌───────────────────────┴──────────┐
//!                              ▼                                  ▼
//!                      ┌──────────────┐                   ┌──────────────┐
//!                      │ RocksStore   │                   │ MemoryStore  │
//!                      │ CF documents │                   │ (tests,      │
//!                      │ CF updates   │                   │  embedding)  │
//!                      │ CF metadata  │                   └──────────────┘
//!                      └──────────────┘
//! ```
//!
//! Documents are addressed by session name. A backend stores one full
//! state snapshot plus the updates appended since; storing a new full
//! state compacts those updates away.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),
    /// A writer panicked while holding the store lock
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Backend contract used by the persistence bridge.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
pub trait DocumentStorage: Send + Sync + 'static {
    /// Stored updates for `name`, oldest first, or `None` if nothing is stored.
    fn load(&self, name: &str) -> Result<Option<Vec<Vec<u8>>>, StoreError>;

    /// Append one incremental update. Returns the sequence number assigned.
    fn append_update(&self, name: &str, update: &[u8]) -> Result<u64, StoreError>;

    /// Replace everything stored for `name` with a single full state.
    fn store_full_state(&self, name: &str, state: &[u8]) -> Result<(), StoreError>;
}
