//! Presence (awareness) table for a session.
//!
//! Each client ID maps to an opaque JSON state plus a logical clock:
//!
//! ```text
//! absent ──update(clock > stored)──► present(state, clock)
//!    ▲                                    │
//!    └──── null state / owner closed ─────┘
//! ```
//!
//! An incoming entry is accepted only when its clock is strictly greater
//! than the stored one, so duplicate and stale deliveries are no-ops.
//! Clocks survive removal; a late update from before the removal stays
//! rejected.
//!
//! Wire format of a presence update:
//! ```text
//! [var n] { [var client_id] [var clock] [var-string state_json] } × n
//! ```

use std::collections::HashMap;

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::protocol::ProtocolError;

/// Client identifier chosen by each replica.
pub type ClientId = u64;

/// State value that marks a client as gone.
pub const NULL_STATE: &str = "null";

/// A client's current presence entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub clock: u64,
    /// Opaque JSON blob (cursor, user name, ...).
    pub state: String,
}

/// Which clients an accepted update touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PresenceChange {
    /// True when nothing was accepted.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client touched, in added/updated/removed order.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Presence states for all clients of one session.
#[derive(Debug, Clone, Default)]
pub struct PresenceTable {
    states: HashMap<ClientId, String>,
    /// Last clock seen per client, kept after removal.
    clocks: HashMap<ClientId, u64>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of present clients.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Present entry for a client.
    pub fn get(&self, client: ClientId) -> Option<PresenceEntry> {
        let state = self.states.get(&client)?;
        Some(PresenceEntry {
            clock: self.clocks.get(&client).copied().unwrap_or_default(),
            state: state.clone(),
        })
    }

    /// Last clock seen for a client, present or not.
    pub fn clock(&self, client: ClientId) -> Option<u64> {
        self.clocks.get(&client).copied()
    }

    /// Present client IDs, sorted.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Apply an encoded presence update.
    ///
    /// The whole update is decoded before anything is applied, so a
    /// malformed update leaves the table untouched.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<PresenceChange, ProtocolError> {
        let entries = decode_update(update)?;
        let mut change = PresenceChange::default();

        for (client, clock, state) in entries {
            if self.clocks.get(&client).is_some_and(|&current| clock <= current) {
                log::trace!("Dropping stale presence for client {client} (clock {clock})");
                continue;
            }
            self.clocks.insert(client, clock);

            if state.trim() == NULL_STATE {
                if self.states.remove(&client).is_some() {
                    change.removed.push(client);
                }
            } else if self.states.insert(client, state).is_some() {
                change.updated.push(client);
            } else {
                change.added.push(client);
            }
        }

        Ok(change)
    }

    /// Remove clients on behalf of the hub (e.g. their connection closed).
    ///
    /// Each removed client's clock is bumped so the broadcast removal is
    /// strictly newer than anything peers hold. Returns the clients that
    /// were actually present.
    pub fn remove_states(&mut self, clients: &[ClientId]) -> Vec<ClientId> {
        let mut removed = Vec::new();
        for &client in clients {
            if self.states.remove(&client).is_some() {
                *self.clocks.entry(client).or_default() += 1;
                removed.push(client);
            }
        }
        removed
    }

    /// Encode the given clients; absent ones are written with a null state.
    ///
    /// Clients never seen are skipped.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let known: Vec<(ClientId, u64)> = clients
            .iter()
            .filter_map(|&client| self.clocks.get(&client).map(|&clock| (client, clock)))
            .collect();

        let mut buf = Vec::new();
        buf.write_var(known.len() as u64);
        for (client, clock) in known {
            let state = self
                .states
                .get(&client)
                .map(String::as_str)
                .unwrap_or(NULL_STATE);
            buf.write_var(client);
            buf.write_var(clock);
            buf.write_string(state);
        }
        buf
    }

    /// Snapshot of every present client.
    pub fn encode_all(&self) -> Vec<u8> {
        self.encode_update(&self.client_ids())
    }
}

/// Decode a presence update into `(client, clock, state)` entries.
pub fn decode_update(update: &[u8]) -> Result<Vec<(ClientId, u64, String)>, ProtocolError> {
    let mut cursor = Cursor::new(update);
    let count: u64 = cursor.read_var()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let client: u64 = cursor.read_var()?;
        let clock: u64 = cursor.read_var()?;
        let state = cursor.read_string()?.to_owned();
        entries.push((client, clock, state));
    }
    Ok(entries)
}

/// Encode raw `(client, clock, state)` entries.
pub fn encode_entries(entries: &[(ClientId, u64, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_var(entries.len() as u64);
    for (client, clock, state) in entries {
        buf.write_var(*client);
        buf.write_var(*clock);
        buf.write_string(state);
    }
    buf
}
