//! # tandem-hub - Real-time collaboration session hub
//!
//! Keeps one shared document per named session, relays sync and presence
//! traffic between every replica connected to it, and persists documents
//! across session lifetimes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket /name   ┌───────────────────────────────┐
//! │ Replica A   │ ◄─────────────────► │ HubServer                     │
//! └─────────────┘                     │   └─ serve_connection (per ws)│
//! ┌─────────────┐                     └──────────────┬────────────────┘
//! │ Replica B   │ ◄──────────────────────────────────┤
//! └─────────────┘                                    ▼
//!                                     ┌───────────────────────────────┐
//!                                     │ Hub (session registry)        │
//!                                     └──────────────┬────────────────┘
//!                                                    ▼
//!                              ┌──────────────── Session ──────────────┐
//!                              │ SharedDoc (Yrs)   PresenceTable       │
//!                              │ connections → controlled client IDs   │
//!                              └──────┬────────────────────┬───────────┘
//!                                     ▼                    ▼
//!                         PersistenceBinding        MutationNotifier
//!                         (RocksStore / memory)     (debounced callback)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (sync + presence frames)
//! - [`doc`]: Yrs-backed shared document
//! - [`presence`]: Clock-ordered presence table
//! - [`session`]: Per-session state machines and fan-out
//! - [`hub`]: Session registry and connection lifecycle
//! - [`connection`]: Connection handles, liveness and the socket driver
//! - [`persistence`]: Load/append/flush bridge to storage
//! - [`storage`]: RocksDB and in-memory backends
//! - [`notifier`]: Debounced mutation callback
//! - [`config`]: Environment configuration
//! - [`server`]: TCP/WebSocket front end

pub mod config;
pub mod connection;
pub mod doc;
pub mod hub;
pub mod notifier;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use config::{ConfigError, DebounceConfig, ServerConfig};
pub use connection::{ConnectionHandle, ConnectionId, Outbound, TransportSendError};
pub use doc::{DocError, SharedDoc};
pub use hub::{Hub, HubStats};
pub use notifier::{Debouncer, LogMutations, MutationCallback, MutationNotifier};
pub use persistence::{PersistenceBinding, PersistenceBridge, PersistenceError};
pub use presence::{ClientId, PresenceChange, PresenceEntry, PresenceTable};
pub use protocol::{Message, ProtocolError, SyncMessage};
pub use server::{HubServer, ServerError};
pub use session::{Departure, Session};
pub use storage::{DocumentMetadata, DocumentStorage, MemoryStore, RocksStore, StoreConfig, StoreError};
