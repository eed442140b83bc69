//! Awareness: ephemeral per-client presence (cursor, selection, profile).
//!
//! ## Wire format
//!
//! ```text
//! count: varint
//! repeat count × ┌────────────┬────────────┬──────────────────────────┐
//!                │ client_id  │ clock      │ state                    │
//!                │ varint     │ varint     │ varstring (JSON text)    │
//!                └────────────┴────────────┴──────────────────────────┘
//! ```
//!
//! The JSON text `null` marks a removal. Presence states are otherwise opaque:
//! they are validated as JSON and stored verbatim.
//!
//! ## Clock rules
//!
//! An entry is replaced only by a change with a newer clock. An equal clock is
//! accepted only when it removes a live entry. Removed clients keep their
//! clock so late, stale updates stay rejected.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::ProtocolError;
use crate::protocol::{Decoder, Encoder};

/// Client identifier chosen by the peer's replica.
pub type ClientId = u64;

/// JSON text that encodes a removal on the wire.
const NULL_STATE: &str = "null";

/// One (client, clock, state) triple. `state == None` is a removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: Option<String>,
}

impl AwarenessChange {
    pub fn set(client_id: ClientId, clock: u64, state: impl Into<String>) -> Self {
        Self {
            client_id,
            clock,
            state: Some(state.into()),
        }
    }

    pub fn removal(client_id: ClientId, clock: u64) -> Self {
        Self {
            client_id,
            clock,
            state: None,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }
}

/// A batch of awareness changes as carried by one awareness message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub changes: Vec<AwarenessChange>,
}

impl AwarenessUpdate {
    pub fn new(changes: Vec<AwarenessChange>) -> Self {
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_var(self.changes.len() as u64);
        for change in &self.changes {
            enc.write_var(change.client_id);
            enc.write_var(change.clock);
            enc.write_string(change.state.as_deref().unwrap_or(NULL_STATE));
        }
        enc.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        let count = dec.read_var()?;
        // Each triple needs at least three bytes; bound the allocation by the frame.
        let mut changes = Vec::with_capacity((count as usize).min(dec.remaining() / 3));
        for _ in 0..count {
            let client_id = dec.read_var()?;
            let clock = dec.read_var()?;
            let raw = dec.read_string()?;
            let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
                ProtocolError::InvalidAwarenessState {
                    client_id,
                    reason: e.to_string(),
                }
            })?;
            let state = if value.is_null() {
                None
            } else {
                Some(raw.to_string())
            };
            changes.push(AwarenessChange {
                client_id,
                clock,
                state,
            });
        }
        dec.finish()?;
        Ok(Self { changes })
    }
}

/// Stored presence for one client.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub clock: u64,
    /// `None` once the client has been removed
    pub state: Option<String>,
    pub last_updated: Instant,
}

/// Per-document map from client id to presence state.
#[derive(Debug, Default)]
pub struct AwarenessTable {
    entries: HashMap<ClientId, AwarenessEntry>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one change. Returns `true` if it was accepted.
    pub fn apply(&mut self, change: &AwarenessChange) -> bool {
        let accepted = match self.entries.get(&change.client_id) {
            None => true,
            Some(entry) if change.clock > entry.clock => true,
            Some(entry) => {
                change.clock == entry.clock && change.is_removal() && entry.state.is_some()
            }
        };

        if accepted {
            self.entries.insert(
                change.client_id,
                AwarenessEntry {
                    clock: change.clock,
                    state: change.state.clone(),
                    last_updated: Instant::now(),
                },
            );
        }
        accepted
    }

    /// Remove a live client, bumping its clock. Returns the removal to broadcast.
    pub fn remove(&mut self, client_id: ClientId) -> Option<AwarenessChange> {
        let entry = self.entries.get_mut(&client_id)?;
        entry.state.as_ref()?;
        entry.clock += 1;
        entry.state = None;
        entry.last_updated = Instant::now();
        Some(AwarenessChange::removal(client_id, entry.clock))
    }

    /// Live state for a client.
    pub fn state(&self, client_id: ClientId) -> Option<&str> {
        self.entries.get(&client_id)?.state.as_deref()
    }

    /// Last seen clock for a client, including removed ones.
    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.entries.get(&client_id).map(|e| e.clock)
    }

    /// Every live entry, for a newcomer's initial snapshot.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut changes: Vec<AwarenessChange> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .state
                    .as_ref()
                    .map(|s| AwarenessChange::set(*id, entry.clock, s.clone()))
            })
            .collect();
        changes.sort_by_key(|c| c.client_id);
        AwarenessUpdate { changes }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
