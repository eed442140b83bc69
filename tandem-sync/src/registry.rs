//! Process-wide map from document name to [`Session`].
//!
//! Sessions are created lazily on first reference. A session's lifetime is
//! tied to its membership: once the last connection leaves it becomes idle,
//! and [`SessionRegistry::evict_idle`] drops sessions that have been idle for
//! at least the configured grace period. Without a grace period nothing ever
//! calls `evict_idle`, so every session lives as long as the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};

use crate::auth::ClientIdentity;
use crate::broadcast::Frame;
use crate::document::{ReplicatedDoc, YrsDocument};
use crate::session::{Session, Subscription};

/// Registry of live sessions.
pub struct SessionRegistry<D: ReplicatedDoc = YrsDocument> {
    sessions: RwLock<HashMap<String, Arc<Session<D>>>>,
    peer_queue_capacity: usize,
}

impl<D: ReplicatedDoc + Default> SessionRegistry<D> {
    pub fn new(peer_queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            peer_queue_capacity,
        }
    }

    /// Get or create the session for `name`.
    ///
    /// Concurrent callers with the same name always get the same instance.
    pub async fn get_or_create(&self, name: &str) -> Arc<Session<D>> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(name) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        Self::entry(&mut sessions, name, self.peer_queue_capacity)
    }

    fn entry(
        sessions: &mut HashMap<String, Arc<Session<D>>>,
        name: &str,
        peer_queue_capacity: usize,
    ) -> Arc<Session<D>> {
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(name) {
            return session.clone();
        }
        let session = Arc::new(Session::new(name, D::default(), peer_queue_capacity));
        sessions.insert(name.to_string(), session.clone());
        log::info!("Session '{name}' created ({} active)", sessions.len());
        session
    }

    /// Resolve the session for `name` and join it in one step.
    ///
    /// The join happens while the registry lock is held, so an eviction sweep
    /// can never remove a session between lookup and join.
    pub async fn admit(
        &self,
        name: &str,
        identity: ClientIdentity,
    ) -> (Subscription<D>, mpsc::Receiver<Frame>) {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(name) {
                return session.join(identity);
            }
        }

        let mut sessions = self.sessions.write().await;
        let session = Self::entry(&mut sessions, name, self.peer_queue_capacity);
        session.join(identity)
    }
}

impl<D: ReplicatedDoc> SessionRegistry<D> {
    /// Look up an existing session without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<Session<D>>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Drop every session that has had no connection for at least `grace`.
    /// Returns the names of the evicted sessions.
    pub async fn evict_idle(&self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.idle_for(now).is_some_and(|idle| idle >= grace))
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            sessions.remove(name);
            log::info!("Session '{name}' evicted after {grace:?} idle");
        }
        expired
    }

    /// Snapshot of all live sessions.
    pub async fn sessions(&self) -> Vec<Arc<Session<D>>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Names of all live sessions.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
