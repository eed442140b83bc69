//! Per-document session: replica + awareness table + connection set.
//!
//! ```text
//!            ┌──────────────────── Session ("doc-42") ────────────────────┐
//! frame ───► │ decode ─► Step1  ─► diff_since ──────────► reply to sender │
//!            │        ─► Step2/Update ─► apply ─► fan-out (skip origin)  │
//!            │        ─► Awareness ─► clock check ─► fan-out (skip origin)│
//!            └────────────────────────────────────────────────────────────┘
//! ```
//!
//! All state of one session sits behind a single mutex. Every mutation and
//! the fan-out it triggers happen inside one critical section, so a session
//! serializes its own broadcasts while different sessions run in parallel.
//! Nothing awaits while the lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::auth::ClientIdentity;
use crate::awareness::{AwarenessChange, AwarenessTable, AwarenessUpdate, ClientId};
use crate::broadcast::{BroadcastReport, BroadcastStats, ConnectionId, ConnectionSet, Frame};
use crate::document::{ReplicatedDoc, YrsDocument};
use crate::error::ProtocolError;
use crate::protocol::{Message, SyncMessage};

/// An admitted connection and the awareness clients it announced.
struct Member {
    identity: ClientIdentity,
    clients: HashSet<ClientId>,
}

struct SessionState<D> {
    doc: D,
    awareness: AwarenessTable,
    connections: ConnectionSet,
    members: HashMap<ConnectionId, Member>,
    /// Live awareness client id -> the one connection allowed to change it
    owners: HashMap<ClientId, ConnectionId>,
    /// Set while no connection is joined
    idle_since: Option<Instant>,
}

/// The server-side unit for one document.
pub struct Session<D: ReplicatedDoc = YrsDocument> {
    name: String,
    state: Mutex<SessionState<D>>,
}

impl<D: ReplicatedDoc> Session<D> {
    /// Create an empty session. Peers buffer up to `peer_queue_capacity` frames.
    pub fn new(name: impl Into<String>, doc: D, peer_queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SessionState {
                doc,
                awareness: AwarenessTable::new(),
                connections: ConnectionSet::new(peer_queue_capacity),
                members: HashMap::new(),
                owners: HashMap::new(),
                idle_since: Some(Instant::now()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit a connection.
    ///
    /// The returned receiver already holds the handshake: a Step1 carrying the
    /// session's state vector, then an awareness snapshot if anyone is present.
    /// Everything broadcast afterwards queues behind it.
    pub fn join(self: &Arc<Self>, identity: ClientIdentity) -> (Subscription<D>, mpsc::Receiver<Frame>) {
        let id = ConnectionId::new();
        let mut state = self.state.lock();

        let rx = state.connections.add(id);
        state.idle_since = None;

        let step1 = Message::step1(state.doc.state_vector()).encode();
        let mut handshake = vec![Frame::from(step1)];
        if !state.awareness.is_empty() {
            let snapshot = state.awareness.snapshot().encode();
            handshake.push(Frame::from(Message::awareness(snapshot).encode()));
        }
        for frame in handshake {
            if let Err(e) = state.connections.deliver(&id, frame) {
                log::warn!("Handshake for {id} in '{}' failed: {e}", self.name);
            }
        }

        log::info!(
            "Connection {id} ({}) joined '{}' ({} connected)",
            identity.user_id,
            self.name,
            state.members.len() + 1
        );
        state.members.insert(
            id,
            Member {
                identity,
                clients: HashSet::new(),
            },
        );
        drop(state);

        let subscription = Subscription {
            session: Arc::clone(self),
            id,
        };
        (subscription, rx)
    }

    /// Decode one inbound frame from `from` and dispatch it.
    ///
    /// A malformed frame is returned as an error and has no effect; the
    /// connection stays joined.
    pub fn receive(&self, from: ConnectionId, frame: &[u8]) -> Result<(), ProtocolError> {
        let message = Message::decode(frame)?;
        let mut state = self.state.lock();

        match message {
            Message::Sync(SyncMessage::Step1(state_vector)) => {
                let diff = state.doc.diff_since(&state_vector)?;
                let reply = Frame::from(Message::step2(diff).encode());
                if let Err(e) = state.connections.deliver(&from, reply) {
                    log::warn!("Step2 reply to {from} in '{}' failed: {e}", self.name);
                }
            }
            Message::Sync(SyncMessage::Step2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                let applied = state.doc.apply_remote_update(&update, from)?;
                let frame = Frame::from(Message::update(applied.update).encode());
                let report = state.connections.broadcast(&frame, Some(&applied.origin));
                log::debug!(
                    "Update from {from} in '{}' fanned out to {} peers",
                    self.name,
                    report.delivered
                );
            }
            Message::Awareness(payload) => {
                let update = AwarenessUpdate::decode(&payload)?;
                Self::apply_awareness(&mut state, &self.name, from, update);
            }
        }
        Ok(())
    }

    /// Apply presence changes announced by `origin`.
    ///
    /// A client id belongs to the first connection that announces it until
    /// that connection removes it or leaves; changes to it from anyone else
    /// are dropped, as are changes that lose the clock check. The accepted
    /// changes are broadcast to every other connection and returned.
    fn apply_awareness(
        state: &mut SessionState<D>,
        name: &str,
        origin: ConnectionId,
        update: AwarenessUpdate,
    ) -> Vec<AwarenessChange> {
        let mut accepted = Vec::new();
        for change in update.changes {
            let client = change.client_id;
            if let Some(owner) = state.owners.get(&client).filter(|owner| **owner != origin) {
                log::debug!(
                    "Ignoring awareness for client {client} from {origin} in '{name}': owned by {owner}"
                );
                continue;
            }
            if !state.awareness.apply(&change) {
                log::trace!(
                    "Stale awareness for client {client} (clock {}) in '{name}'",
                    change.clock
                );
                continue;
            }
            if let Some(member) = state.members.get_mut(&origin) {
                if change.is_removal() {
                    member.clients.remove(&client);
                    state.owners.remove(&client);
                } else {
                    member.clients.insert(client);
                    state.owners.insert(client, origin);
                }
            }
            accepted.push(change);
        }

        if !accepted.is_empty() {
            let delta = AwarenessUpdate::new(accepted.clone()).encode();
            let frame = Frame::from(Message::awareness(delta).encode());
            state.connections.broadcast(&frame, Some(&origin));
        }
        accepted
    }

    /// Clear every awareness entry announced by `connection` and tell the
    /// remaining peers. Returns the removals that were broadcast.
    pub fn remove_all_awareness(&self, connection: ConnectionId) -> Vec<AwarenessChange> {
        let mut state = self.state.lock();
        Self::remove_all_awareness_locked(&mut state, connection)
    }

    fn remove_all_awareness_locked(
        state: &mut SessionState<D>,
        connection: ConnectionId,
    ) -> Vec<AwarenessChange> {
        let owned: Vec<ClientId> = match state.members.get_mut(&connection) {
            Some(member) => member.clients.drain().collect(),
            None => return Vec::new(),
        };
        for client in &owned {
            state.owners.remove(client);
        }

        let removals: Vec<AwarenessChange> = owned
            .into_iter()
            .filter_map(|client| state.awareness.remove(client))
            .collect();

        if !removals.is_empty() {
            let delta = AwarenessUpdate::new(removals.clone()).encode();
            let frame = Frame::from(Message::awareness(delta).encode());
            state.connections.broadcast(&frame, Some(&connection));
        }
        removals
    }

    /// Deregister a connection: clear its presence, drop its queue, and mark
    /// the session idle if it was the last one.
    fn leave(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        let removals = Self::remove_all_awareness_locked(&mut state, id);
        state.connections.remove(&id);

        let Some(member) = state.members.remove(&id) else {
            return;
        };
        if state.members.is_empty() {
            state.idle_since = Some(Instant::now());
        }
        log::info!(
            "Connection {id} ({}) left '{}' ({} presence entries cleared, {} remaining)",
            member.identity.user_id,
            self.name,
            removals.len(),
            state.members.len()
        );
    }

    /// Fan an arbitrary message out to every connection except `origin`.
    pub fn broadcast(&self, message: &Message, origin: Option<ConnectionId>) -> BroadcastReport {
        let frame = Frame::from(message.encode());
        let mut state = self.state.lock();
        state.connections.broadcast(&frame, origin.as_ref())
    }

    /// Connections currently reachable by fan-out.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids = self.state.lock().connections.ids();
        ids.sort();
        ids
    }

    pub fn has_connection(&self, id: &ConnectionId) -> bool {
        self.state.lock().connections.contains(id)
    }

    /// Joined connections, including evicted ones that have not closed yet.
    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// How long the session has had no joined connection.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .idle_since
            .map(|since| now.saturating_duration_since(since))
    }

    pub fn awareness_state(&self, client_id: ClientId) -> Option<String> {
        self.state.lock().awareness.state(client_id).map(str::to_string)
    }

    pub fn awareness_len(&self) -> usize {
        self.state.lock().awareness.len()
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.state.lock().doc.state_vector()
    }

    /// Read the replica under the session lock.
    pub fn with_doc<R>(&self, read: impl FnOnce(&D) -> R) -> R {
        read(&self.state.lock().doc)
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.state.lock().connections.stats()
    }
}

/// Membership handle for one connection.
///
/// Dropping it is the close event: the connection leaves the session, its
/// awareness entries are removed and the removal is broadcast, all before
/// `drop` returns.
pub struct Subscription<D: ReplicatedDoc = YrsDocument> {
    session: Arc<Session<D>>,
    id: ConnectionId,
}

impl<D: ReplicatedDoc> Subscription<D> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session(&self) -> &Arc<Session<D>> {
        &self.session
    }

    /// Dispatch an inbound frame on behalf of this connection.
    pub fn receive(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.session.receive(self.id, frame)
    }

    /// Leave the session now.
    pub fn close(self) {
        drop(self);
    }
}

impl<D: ReplicatedDoc> Drop for Subscription<D> {
    fn drop(&mut self) {
        self.session.leave(self.id);
    }
}
