//! Fan-out of encoded frames to the connections of one session.
//!
//! Each connection owns a bounded outbound queue drained by its socket task.
//! Fan-out never awaits: a frame is pushed into every peer queue except the
//! originator's. A peer whose queue is full (lagging) or closed (gone) is
//! evicted on the spot and the fan-out continues with the remaining peers.
//!
//! Callers hold the session lock across a fan-out, so frames produced by one
//! session reach every peer queue in the order the session produced them.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::error::DeliveryError;

/// Encoded frame shared by every recipient of a fan-out.
///
/// Cloning is a reference-count bump, and the socket writer sends the same
/// buffer without copying.
pub type Frame = Bytes;

/// Opaque identifier for one admitted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub peers_evicted: u64,
    pub active_peers: usize,
}

/// The active connection set of one session.
pub struct ConnectionSet {
    peers: HashMap<ConnectionId, mpsc::Sender<Frame>>,
    /// Frames buffered per peer before it counts as lagging
    capacity: usize,
    frames_sent: u64,
    peers_evicted: u64,
}

impl ConnectionSet {
    /// Create an empty set whose peers buffer up to `capacity` frames.
    ///
    /// At least two slots are kept so a join handshake (Step1 plus awareness
    /// snapshot) always fits.
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(2),
            frames_sent: 0,
            peers_evicted: 0,
        }
    }

    /// Register a connection and return the receiving end of its queue.
    pub fn add(&mut self, id: ConnectionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers.insert(id, tx);
        rx
    }

    /// Drop a connection's queue. Returns `false` if it was not present.
    pub fn remove(&mut self, id: &ConnectionId) -> bool {
        self.peers.remove(id).is_some()
    }

    /// Queue a frame for a single connection.
    pub fn deliver(&mut self, to: &ConnectionId, frame: Frame) -> Result<(), DeliveryError> {
        let tx = self.peers.get(to).ok_or(DeliveryError::Disconnected)?;
        match try_send(tx, frame) {
            Ok(()) => {
                self.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.evict(to, e);
                Err(e)
            }
        }
    }

    /// Queue a frame for every connection except `origin`.
    pub fn broadcast(&mut self, frame: &Frame, origin: Option<&ConnectionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (id, tx) in &self.peers {
            if Some(id) == origin {
                continue;
            }
            match try_send(tx, frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => failed.push((*id, e)),
            }
        }

        for (id, err) in failed {
            self.evict(&id, err);
            report.evicted.push(id);
        }

        self.frames_sent += report.delivered as u64;
        report
    }

    fn evict(&mut self, id: &ConnectionId, reason: DeliveryError) {
        if self.peers.remove(id).is_some() {
            self.peers_evicted += 1;
            log::warn!("Evicting peer {id}: {reason}");
        }
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Connection ids in the set (unordered).
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent,
            peers_evicted: self.peers_evicted,
            active_peers: self.peers.len(),
        }
    }
}

fn try_send(tx: &mpsc::Sender<Frame>, frame: Frame) -> Result<(), DeliveryError> {
    tx.try_send(frame).map_err(|e| match e {
        TrySendError::Full(_) => DeliveryError::QueueFull,
        TrySendError::Closed(_) => DeliveryError::Disconnected,
    })
}
