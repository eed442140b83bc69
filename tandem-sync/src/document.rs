//! Replicated document capability.
//!
//! The server never looks inside a document: it only moves state vectors and
//! updates between peers and the replica. Any convergent replicated data type
//! that can answer these four questions can back a session.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::broadcast::ConnectionId;
use crate::error::DocError;

/// An update integrated into a replica, tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    /// Update produced by the applying transaction (what peers need to receive)
    pub update: Vec<u8>,
    pub origin: ConnectionId,
}

/// Opaque, convergent per-document replica.
pub trait ReplicatedDoc: Send + 'static {
    /// Encoded summary of the updates this replica has integrated.
    fn state_vector(&self) -> Vec<u8>;

    /// Everything this replica has that a peer with `state_vector` lacks.
    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError>;

    /// Integrate an update received from `origin` and return the update the
    /// integration produced.
    fn apply_remote_update(
        &mut self,
        update: &[u8],
        origin: ConnectionId,
    ) -> Result<AppliedUpdate, DocError>;

    /// Full state as a single update.
    fn encode_state(&self) -> Vec<u8>;
}

/// [`ReplicatedDoc`] backed by a Yrs `Doc` (v1 update encoding).
pub struct YrsDocument {
    doc: yrs::Doc,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self { doc: yrs::Doc::new() }
    }

    /// Wrap an existing Yrs document.
    pub fn from_doc(doc: yrs::Doc) -> Self {
        Self { doc }
    }

    /// Underlying Yrs document, for reading shared types.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }

    /// Run a local mutation and return the update it produced.
    pub fn produce_update<F>(&self, mutate: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut<'_>),
    {
        let mut txn = Transact::transact_mut(&self.doc);
        mutate(&mut txn);
        txn.encode_update_v1()
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDoc for YrsDocument {
    fn state_vector(&self) -> Vec<u8> {
        let txn = Transact::transact(&self.doc);
        txn.state_vector().encode_v1()
    }

    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let remote_sv =
            StateVector::decode_v1(state_vector).map_err(|e| DocError::StateVector(e.to_string()))?;
        let txn = Transact::transact(&self.doc);
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    fn apply_remote_update(
        &mut self,
        update: &[u8],
        origin: ConnectionId,
    ) -> Result<AppliedUpdate, DocError> {
        let decoded = Update::decode_v1(update).map_err(|e| DocError::Update(e.to_string()))?;
        let mut txn = Transact::transact_mut(&self.doc);
        txn.apply_update(decoded)
            .map_err(|e| DocError::Apply(e.to_string()))?;
        Ok(AppliedUpdate {
            update: txn.encode_update_v1(),
            origin,
        })
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = Transact::transact(&self.doc);
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}
