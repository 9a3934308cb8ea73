//! The hub: session registry plus connection lifecycle.
//!
//! Architecture:
//! ```text
//!                      ┌──────────────────────── Hub ───────────────────────┐
//!  connection ──────►  │ sessions: Mutex<HashMap<name, Arc<Session>>>       │
//!  (connect/dispatch/  │ gates:    Mutex<HashMap<name, Arc<Mutex<()>>>>     │
//!   send/close)        │ persistence: Option<PersistenceBridge>             │
//!                      │ callback: Option<Arc<dyn MutationCallback>>        │
//!                      └──────────────┬─────────────────────────────────────┘
//!                                     │ resolve (create + bind under the
//!                                     │ name's gate)
//!                                     ▼
//!                      Session ── SharedDoc ── PresenceTable ── connections
//! ```
//!
//! Locking: every name has a gate, an async mutex. Creating a session
//! (including its persistence bind), registering a connection in it and
//! tearing it down (final flush and callback) all happen under that name's
//! gate, so there is at most one session per name and a session being torn
//! down never gains a connection. Storage I/O for one name never holds up
//! another: the `sessions` and `gates` maps are only locked for lookups and
//! inserts. Order is gate, then map, then session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::doc::SharedDoc;
use crate::notifier::{MutationCallback, MutationNotifier};
use crate::persistence::PersistenceBridge;
use crate::protocol::ProtocolError;
use crate::session::Session;
use crate::storage::{DocumentStorage, RocksStore, StoreConfig, StoreError};

/// Hub-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_sessions: usize,
}

/// Registry of live sessions and entry point for every connection event.
pub struct Hub {
    config: ServerConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    persistence: Option<PersistenceBridge>,
    callback: Option<Arc<dyn MutationCallback>>,
    next_connection: AtomicU64,
    stats: RwLock<HubStats>,
}

impl Hub {
    pub fn new(
        config: ServerConfig,
        storage: Option<Arc<dyn DocumentStorage>>,
        callback: Option<Arc<dyn MutationCallback>>,
    ) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            persistence: storage.map(PersistenceBridge::new),
            callback,
            next_connection: AtomicU64::new(1),
            stats: RwLock::new(HubStats::default()),
        }
    }

    /// Build a hub from configuration, opening RocksDB storage when
    /// `storage_path` is set.
    pub fn open(
        config: ServerConfig,
        callback: Option<Arc<dyn MutationCallback>>,
    ) -> Result<Self, StoreError> {
        let storage: Option<Arc<dyn DocumentStorage>> = match &config.storage_path {
            Some(path) => {
                let store: Arc<dyn DocumentStorage> =
                    Arc::new(RocksStore::open(StoreConfig::at(path))?);
                log::info!("Persisting documents to {}", path.display());
                Some(store)
            }
            None => None,
        };
        Ok(Self::new(config, storage, callback))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Fresh connection identity, unique for the hub's lifetime.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    // ─── Registry ─────────────────────────────────────────────────────

    /// Session for `name`, created (and bound to storage) if absent.
    ///
    /// A session created here without a connection lives until a
    /// connection joins and the last one leaves.
    pub async fn resolve(&self, name: &str) -> Arc<Session> {
        let gate = self.gate(name).await;
        let _entered = gate.lock().await;
        self.resolve_entered(name).await
    }

    /// Caller holds `name`'s gate.
    async fn resolve_entered(&self, name: &str) -> Arc<Session> {
        if let Some(session) = self.session(name).await {
            return session;
        }

        let doc = SharedDoc::new(self.config.gc);
        let persistence = match &self.persistence {
            Some(bridge) => Some(bridge.bind(name, &doc).await),
            None => None,
        };
        let notifier = self.callback.as_ref().map(|callback| {
            MutationNotifier::spawn(name.to_string(), Arc::clone(callback), self.config.debounce)
        });

        let session = Arc::new(Session::new(name, doc, persistence, notifier));
        self.sessions
            .lock()
            .await
            .insert(name.to_string(), Arc::clone(&session));
        log::info!("Created session '{name}'");
        session
    }

    /// Gate serialising creation, registration and teardown for `name`.
    async fn gate(&self, name: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        Arc::clone(gates.entry(name.to_string()).or_default())
    }

    /// Drop `name`'s gate once nobody else holds or waits on it.
    async fn retire_gate(&self, name: &str, gate: &Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().await;
        let idle = gates
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, gate) && Arc::strong_count(gate) == 2);
        if idle {
            gates.remove(name);
        }
    }

    /// Live session for `name`, if any.
    pub async fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(name).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Names of live sessions, sorted.
    pub async fn session_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    // ─── Connections ──────────────────────────────────────────────────

    /// Resolve `name` and register `handle` in it atomically.
    pub async fn connect(&self, name: &str, handle: ConnectionHandle) -> Arc<Session> {
        let gate = self.gate(name).await;
        let (session, failed) = {
            let _entered = gate.lock().await;
            let session = self.resolve_entered(name).await;
            let failed = session.register(handle).await;
            (session, failed)
        };

        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }

        self.close_all(&session, failed).await;
        session
    }

    /// Register `handle` in `session`.
    ///
    /// If `session` has already been torn down, the connection joins the
    /// live session of the same name instead. Returns the session joined.
    pub async fn register(&self, session: &Arc<Session>, handle: ConnectionHandle) -> Arc<Session> {
        self.connect(session.name(), handle).await
    }

    /// Feed one inbound frame from `id` into `session`.
    ///
    /// Malformed frames are logged and returned; the connection stays open.
    pub async fn dispatch(
        &self,
        session: &Arc<Session>,
        id: ConnectionId,
        frame: &[u8],
    ) -> Result<(), ProtocolError> {
        let result = session.dispatch(id, frame).await;
        {
            let mut stats = self.stats.write().await;
            stats.total_messages += 1;
            stats.total_bytes += frame.len() as u64;
            if result.is_err() {
                stats.rejected_messages += 1;
            }
        }

        match result {
            Ok(failed) => {
                self.close_all(session, failed).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("Malformed message from {id} on '{}': {e}", session.name());
                Err(e)
            }
        }
    }

    /// Send one frame to `id`. A failed send closes that connection.
    pub async fn send(&self, session: &Arc<Session>, id: ConnectionId, frame: Vec<u8>) {
        if let Err(e) = session.send(id, frame).await {
            log::debug!("{e}; closing");
            self.close(session, id).await;
        }
    }

    /// Deregister `id` from `session` and close its transport.
    ///
    /// Idempotent. Connections whose sends fail during the presence
    /// removal broadcast are closed too. When the session empties it is
    /// flushed and removed from the registry.
    pub async fn close(&self, session: &Arc<Session>, id: ConnectionId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(departure) = session.remove_connection(id).await else {
                continue;
            };
            {
                let mut stats = self.stats.write().await;
                stats.active_connections = stats.active_connections.saturating_sub(1);
            }
            log::info!(
                "{id} left session '{}' ({} remaining)",
                session.name(),
                departure.remaining
            );

            pending.extend(departure.failed);
            if departure.remaining == 0 {
                self.release(session).await;
            }
            departure.handle.close();
        }
    }

    async fn close_all(&self, session: &Arc<Session>, failed: Vec<ConnectionId>) {
        for id in failed {
            self.close(session, id).await;
        }
    }

    /// Tear down `session` if it is still registered and still empty.
    async fn release(&self, session: &Arc<Session>) {
        let name = session.name();
        let gate = self.gate(name).await;
        {
            let _entered = gate.lock().await;
            let registered = self
                .session(name)
                .await
                .is_some_and(|live| Arc::ptr_eq(&live, session));
            if registered && session.connection_count().await == 0 {
                session.shutdown().await;
                self.sessions.lock().await.remove(name);
                log::info!("Closed session '{name}'");
            }
        }
        self.retire_gate(name, &gate).await;
    }

    /// Snapshot of the hub counters.
    pub async fn stats(&self) -> HubStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.session_count().await;
        stats
    }
}
