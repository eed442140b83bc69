//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//!                    ┌─────────────── SyncServer (axum) ─────────────┐
//! TCP ─► Router ────►│ GET /health ──► 200 "okay"                    │
//!                    │ GET /{*doc} upgrade ──► ConnectionGate ──✗──► close 4001
//!                    │                  │ ✓                           │
//!                    │                  ▼                             │
//!                    │        SessionRegistry::admit(doc)             │
//!                    │                  │                             │
//!                    │     ┌────────────┼────────────┐                │
//!                    │     ▼            ▼            ▼                │
//!                    │  Session     Session      Session              │
//!                    │  "doc-42"    "notes"      ...                  │
//!                    └────────────────────────────────────────────────┘
//! ```
//!
//! Each upgraded socket runs one task:
//! `Connecting → Authenticating → HandshakeSent → Active → Closed`.
//! Inbound frames go to the connection's [`Subscription`]; outbound frames
//! arrive on its queue and are written in order. Leaving the loop for any
//! reason drops the subscription, which removes the connection from its
//! session and clears its awareness entries before the task finishes.
//!
//! [`Subscription`]: crate::session::Subscription

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::auth::ConnectionGate;
use crate::config::ServerConfig;
use crate::document::{ReplicatedDoc, YrsDocument};
use crate::error::ServerResult;
use crate::http;
use crate::registry::SessionRegistry;

/// Close code sent when the connection gate rejects a token.
pub const AUTH_FAILURE_CLOSE_CODE: u16 = 4001;

/// How long a rejected socket waits for the client's close reply.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket upgraded, document name taken from the path
    Connecting,
    /// Token being verified
    Authenticating,
    /// Step1 (and awareness snapshot) queued for the peer
    HandshakeSent,
    /// Frames flowing in both directions
    Active,
    Closed,
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub health_checks: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    /// Frames queued to peers across live sessions
    pub frames_sent: u64,
    /// Peers evicted for a full or closed queue across live sessions
    pub peers_evicted: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    pub(crate) health_checks: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a route handler needs, shared through the router.
pub(crate) struct ServerState<D: ReplicatedDoc> {
    pub(crate) registry: Arc<SessionRegistry<D>>,
    pub(crate) gate: ConnectionGate,
    pub(crate) stats: Arc<StatsCounters>,
}

impl<D: ReplicatedDoc + Default> ServerState<D> {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.peer_queue_capacity)),
            gate: ConnectionGate::from_config(config),
            stats: Arc::new(StatsCounters::default()),
        }
    }
}

impl<D: ReplicatedDoc> Clone for ServerState<D> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            gate: self.gate.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// The sync server.
pub struct SyncServer<D: ReplicatedDoc = YrsDocument> {
    config: ServerConfig,
    state: ServerState<D>,
}

impl<D: ReplicatedDoc + Default> SyncServer<D> {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: ServerState::new(&config),
            config,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> ServerResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        let sweeper = self.config.session_grace.map(|grace| self.spawn_sweeper(grace));
        if sweeper.is_none() {
            log::info!("No session grace period configured; idle sessions are kept forever");
        }

        let app = http::router(self.state.clone());
        let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
        if let Some(handle) = sweeper {
            handle.abort();
        }
        result?;
        Ok(())
    }

    fn spawn_sweeper(&self, grace: Duration) -> JoinHandle<()> {
        let registry = self.state.registry.clone();
        let period = (grace / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(grace).await;
                if !evicted.is_empty() {
                    log::debug!("Sweeper evicted {} idle sessions", evicted.len());
                }
            }
        })
    }
}

/// Drive one upgraded socket through its lifecycle.
pub(crate) async fn handle_socket<D: ReplicatedDoc + Default>(
    mut socket: WebSocket,
    addr: SocketAddr,
    document: String,
    token: Option<String>,
    state: ServerState<D>,
) {
    let ServerState { registry, gate, stats } = state;
    let mut conn = ConnectionState::Connecting;
    StatsCounters::bump(&stats.total_connections);

    transition(&mut conn, ConnectionState::Authenticating, addr);
    let identity = match gate.authenticate(token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            StatsCounters::bump(&stats.rejected_connections);
            log::warn!("Rejecting {addr} for '{document}': {e}");
            let frame = CloseFrame {
                code: AUTH_FAILURE_CLOSE_CODE,
                reason: "unauthorized".into(),
            };
            if socket.send(WsMessage::Close(Some(frame))).await.is_ok() {
                let _ = tokio::time::timeout(CLOSE_LINGER, async {
                    while let Some(Ok(_)) = socket.recv().await {}
                })
                .await;
            }
            transition(&mut conn, ConnectionState::Closed, addr);
            return;
        }
    };

    let (subscription, mut outbound) = registry.admit(&document, identity).await;
    transition(&mut conn, ConnectionState::HandshakeSent, addr);
    transition(&mut conn, ConnectionState::Active, addr);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        StatsCounters::bump(&stats.frames_received);
                        if let Err(e) = subscription.receive(&data) {
                            StatsCounters::bump(&stats.frames_dropped);
                            log::warn!("Dropping frame from {addr} in '{document}': {e}");
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    // Pings are answered by the websocket layer.
                    Some(Ok(_)) => {}
                }
            }

            // Outgoing frames queued by the session
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_sender.send(WsMessage::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        log::warn!("Connection {addr} was evicted from '{document}'");
                        break;
                    }
                }
            }
        }
    }

    drop(subscription);
    let _ = ws_sender.close().await;
    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    transition(&mut conn, ConnectionState::Closed, addr);
}

impl<D: ReplicatedDoc> SyncServer<D> {
    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let sessions = self.state.registry.sessions().await;
        let (frames_sent, peers_evicted) = sessions
            .iter()
            .map(|s| s.broadcast_stats())
            .fold((0, 0), |(sent, evicted), b| {
                (sent + b.frames_sent, evicted + b.peers_evicted)
            });

        let stats = &self.state.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: stats.rejected_connections.load(Ordering::Relaxed),
            health_checks: stats.health_checks.load(Ordering::Relaxed),
            frames_received: stats.frames_received.load(Ordering::Relaxed),
            frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
            frames_sent,
            peers_evicted,
            active_sessions: sessions.len(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Session registry reference.
    pub fn registry(&self) -> &Arc<SessionRegistry<D>> {
        &self.state.registry
    }
}

fn transition(state: &mut ConnectionState, next: ConnectionState, addr: SocketAddr) {
    log::debug!("{addr}: {state:?} -> {next:?}");
    *state = next;
}
