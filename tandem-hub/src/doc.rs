//! Shared document state backed by a Yrs `Doc`.
//!
//! The hub never looks inside the document; it only moves encoded
//! updates in and out. Merge semantics belong to Yrs.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Update};

/// Errors raised while moving updates into or out of a document.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocError {
    #[error("Invalid update encoding: {0}")]
    InvalidUpdate(String),
    #[error("Invalid state vector: {0}")]
    InvalidStateVector(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

/// The authoritative replica of one session's document.
pub struct SharedDoc {
    doc: Doc,
    gc: bool,
}

impl SharedDoc {
    /// Create an empty document.
    ///
    /// With `gc` disabled, deleted content is kept as history instead of
    /// being collected.
    pub fn new(gc: bool) -> Self {
        let options = Options {
            skip_gc: !gc,
            ..Options::default()
        };
        Self {
            doc: Doc::with_options(options),
            gc,
        }
    }

    /// Encoded state vector (what this replica has seen).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Full document state encoded as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything a replica with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Merge an encoded update into the document.
    ///
    /// Returns what the merge actually changed, encoded as an update, or
    /// `None` when the document is unchanged (empty, already seen, or
    /// still waiting on missing dependencies).
    pub fn apply_update(&self, update: &[u8]) -> Result<Option<Vec<u8>>, DocError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocError::Apply(format!("{e:?}")))?;
        txn.commit();

        if txn.before_state() == txn.after_state() && txn.delete_set().is_empty() {
            return Ok(None);
        }
        Ok(Some(txn.encode_update_v1()))
    }

    /// Whether history garbage collection is enabled.
    pub fn gc_enabled(&self) -> bool {
        self.gc
    }

    /// Underlying Yrs document.
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new(true)
    }
}
