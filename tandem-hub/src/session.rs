//! One named collaborative document plus its live connections.
//!
//! A `Session` owns its document, its connection table and its presence
//! table behind a single async mutex. All sends are non-blocking queue
//! pushes, so the lock is never held across socket I/O. Sends that fail
//! are reported back as connection IDs for the hub to tear down; a
//! session never closes connections itself.
//!
//! ```text
//! dispatch(origin, frame)
//!   ├─ sync step 1      → reply (step 2) to origin only
//!   ├─ sync step 2/upd  → apply; if it changed the doc, fan out the
//!   │                     change to all, persist, notify
//!   ├─ presence         → apply, attribute new clients to origin,
//!   │                     fan out changed entries to all (origin included)
//!   └─ unknown kind     → ignored
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::connection::{ConnectionHandle, ConnectionId, TransportSendError};
use crate::doc::SharedDoc;
use crate::notifier::MutationNotifier;
use crate::persistence::PersistenceBinding;
use crate::presence::{ClientId, PresenceEntry, PresenceTable};
use crate::protocol::{
    read_sync_message, write_presence, write_sync_step1, write_update, Message, ProtocolError,
};

struct ConnectionEntry {
    handle: ConnectionHandle,
    /// Presence clients introduced by this connection.
    controlled: HashSet<ClientId>,
}

struct SessionState {
    doc: SharedDoc,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    presence: PresenceTable,
}

impl SessionState {
    fn send_to(&self, id: ConnectionId, frame: Vec<u8>) -> Result<(), TransportSendError> {
        match self.connections.get(&id) {
            Some(entry) => entry.handle.send(Arc::new(frame)),
            None => Err(TransportSendError(id)),
        }
    }

    /// Fan a frame out to every connection, collecting the ones that failed.
    fn broadcast(&self, frame: Vec<u8>, failed: &mut Vec<ConnectionId>) {
        let frame = Arc::new(frame);
        for (id, entry) in &self.connections {
            if entry.handle.send(Arc::clone(&frame)).is_err() {
                failed.push(*id);
            }
        }
    }
}

/// Result of removing a connection from a session.
#[derive(Debug)]
pub struct Departure {
    /// Handle of the removed connection, for closing its transport.
    pub handle: ConnectionHandle,
    /// Connections still registered afterwards.
    pub remaining: usize,
    /// Connections whose send failed during the removal broadcast.
    pub failed: Vec<ConnectionId>,
}

/// A live collaborative session.
pub struct Session {
    name: String,
    state: Mutex<SessionState>,
    persistence: Option<PersistenceBinding>,
    notifier: Option<MutationNotifier>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        doc: SharedDoc,
        persistence: Option<PersistenceBinding>,
        notifier: Option<MutationNotifier>,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SessionState {
                doc,
                connections: HashMap::new(),
                presence: PresenceTable::new(),
            }),
            persistence,
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a connection with an empty controlled set and greet it with a
    /// sync step 1 plus, if anyone is present, a presence snapshot.
    ///
    /// Returns connections whose send failed.
    pub async fn register(&self, handle: ConnectionHandle) -> Vec<ConnectionId> {
        let id = handle.id();
        let mut state = self.state.lock().await;
        state.connections.insert(
            id,
            ConnectionEntry {
                handle,
                controlled: HashSet::new(),
            },
        );

        let mut failed = Vec::new();
        let step1 = write_sync_step1(&state.doc);
        if state.send_to(id, step1).is_err() {
            failed.push(id);
        } else if !state.presence.is_empty() {
            let snapshot = write_presence(&state.presence.encode_all());
            if state.send_to(id, snapshot).is_err() {
                failed.push(id);
            }
        }
        failed
    }

    /// Handle one inbound frame from `origin`.
    ///
    /// Returns connections whose send failed. A decode error leaves the
    /// session untouched.
    pub async fn dispatch(
        &self,
        origin: ConnectionId,
        frame: &[u8],
    ) -> Result<Vec<ConnectionId>, ProtocolError> {
        match Message::decode(frame)? {
            Message::Sync(sync) => {
                let mut failed = Vec::new();
                let applied = {
                    let state = self.state.lock().await;
                    let outcome = read_sync_message(sync, &state.doc)?;
                    if let Some(reply) = outcome.reply {
                        if state.send_to(origin, reply).is_err() {
                            failed.push(origin);
                        }
                    }
                    if let Some(update) = &outcome.applied {
                        state.broadcast(write_update(update), &mut failed);
                    }
                    outcome.applied
                };
                if let Some(update) = applied {
                    self.after_mutation(update).await;
                }
                Ok(failed)
            }
            Message::Presence(update) => {
                let mut state = self.state.lock().await;
                let change = state.presence.apply_update(&update)?;
                if change.is_empty() {
                    return Ok(Vec::new());
                }

                if let Some(entry) = state.connections.get_mut(&origin) {
                    entry.controlled.extend(change.added.iter().copied());
                }
                for entry in state.connections.values_mut() {
                    for client in &change.removed {
                        entry.controlled.remove(client);
                    }
                }

                let frame = write_presence(&state.presence.encode_update(&change.changed()));
                let mut failed = Vec::new();
                state.broadcast(frame, &mut failed);
                Ok(failed)
            }
            Message::Unknown(kind) => {
                log::debug!("Ignoring message kind {kind} on '{}'", self.name);
                Ok(Vec::new())
            }
        }
    }

    /// Queue a frame for one registered connection.
    pub async fn send(&self, id: ConnectionId, frame: Vec<u8>) -> Result<(), TransportSendError> {
        self.state.lock().await.send_to(id, frame)
    }

    /// Apply an update that did not come from a connection and fan out
    /// whatever it changed.
    ///
    /// Returns connections whose send failed.
    pub async fn apply_update(&self, update: &[u8]) -> Result<Vec<ConnectionId>, ProtocolError> {
        let mut failed = Vec::new();
        let applied = {
            let state = self.state.lock().await;
            let applied = state.doc.apply_update(update)?;
            if let Some(change) = &applied {
                state.broadcast(write_update(change), &mut failed);
            }
            applied
        };
        if let Some(change) = applied {
            self.after_mutation(change).await;
        }
        Ok(failed)
    }

    /// Deregister a connection and drop the presence clients it controlled,
    /// broadcasting their removal to the rest.
    ///
    /// `None` if the connection was not registered.
    pub async fn remove_connection(&self, id: ConnectionId) -> Option<Departure> {
        let mut state = self.state.lock().await;
        let entry = state.connections.remove(&id)?;

        let mut controlled: Vec<ClientId> = entry.controlled.into_iter().collect();
        controlled.sort_unstable();
        let removed = state.presence.remove_states(&controlled);

        let mut failed = Vec::new();
        if !removed.is_empty() {
            log::debug!(
                "Removing presence of {removed:?} from '{}' after {id} left",
                self.name
            );
            let frame = write_presence(&state.presence.encode_update(&removed));
            state.broadcast(frame, &mut failed);
        }

        Some(Departure {
            handle: entry.handle,
            remaining: state.connections.len(),
            failed,
        })
    }

    /// Final flush before the session is dropped. Errors are logged.
    pub async fn shutdown(&self) {
        if let Some(binding) = &self.persistence {
            let state = self.state.lock().await;
            if let Err(e) = binding.flush(&state.doc).await {
                log::error!("Failed to flush '{}': {e}", self.name);
            }
        }
        if let Some(notifier) = &self.notifier {
            notifier.finish().await;
        }
    }

    async fn after_mutation(&self, update: Vec<u8>) {
        if let Some(binding) = &self.persistence {
            if let Err(e) = binding.append(update.clone()).await {
                log::error!("Failed to persist update for '{}': {e}", self.name);
            }
        }
        if let Some(notifier) = &self.notifier {
            notifier.notify(update);
        }
    }

    // ─── Inspection ───────────────────────────────────────────────────

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Registered connection IDs, sorted.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        let state = self.state.lock().await;
        let mut ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Present clients with their entries, sorted by client ID.
    pub async fn presence_snapshot(&self) -> Vec<(ClientId, PresenceEntry)> {
        let state = self.state.lock().await;
        state
            .presence
            .client_ids()
            .into_iter()
            .filter_map(|client| state.presence.get(client).map(|entry| (client, entry)))
            .collect()
    }

    /// Presence clients attributed to a connection, sorted. `None` if not registered.
    pub async fn controlled_clients(&self, id: ConnectionId) -> Option<Vec<ClientId>> {
        let state = self.state.lock().await;
        let entry = state.connections.get(&id)?;
        let mut clients: Vec<ClientId> = entry.controlled.iter().copied().collect();
        clients.sort_unstable();
        Some(clients)
    }

    /// Full document state as one update.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.doc.encode_state()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("persistent", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}
