//! In-memory backend.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{DocumentStorage, StoreError};

#[derive(Debug, Default, Clone)]
struct Entry {
    full_state: Option<Vec<u8>>,
    updates: Vec<Vec<u8>>,
    full_state_writes: u64,
}

/// `DocumentStorage` kept in process memory. Contents die with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    sequence: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times a full state was written for `name`.
    pub fn full_state_writes(&self, name: &str) -> u64 {
        self.with_entries(|entries| entries.get(name).map_or(0, |e| e.full_state_writes))
            .unwrap_or(0)
    }

    /// Updates appended for `name` since its last full state.
    pub fn update_count(&self, name: &str) -> usize {
        self.with_entries(|entries| entries.get(name).map_or(0, |e| e.updates.len()))
            .unwrap_or(0)
    }

    /// Names with anything stored, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .with_entries(|entries| entries.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> T,
    ) -> Result<T, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut entries))
    }
}

impl DocumentStorage for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        self.with_entries(|entries| {
            entries.get(name).map(|entry| {
                entry
                    .full_state
                    .iter()
                    .chain(entry.updates.iter())
                    .cloned()
                    .collect()
            })
        })
    }

    fn append_update(&self, name: &str, update: &[u8]) -> Result<u64, StoreError> {
        let seq = {
            let mut sequence = self.sequence.lock().map_err(|_| StoreError::Poisoned)?;
            let seq = *sequence;
            *sequence += 1;
            seq
        };
        self.with_entries(|entries| {
            entries
                .entry(name.to_string())
                .or_default()
                .updates
                .push(update.to_vec());
        })?;
        Ok(seq)
    }

    fn store_full_state(&self, name: &str, state: &[u8]) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            let entry = entries.entry(name.to_string()).or_default();
            entry.full_state = Some(state.to_vec());
            entry.updates.clear();
            entry.full_state_writes += 1;
        })
    }
}
