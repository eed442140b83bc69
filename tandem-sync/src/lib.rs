//! # tandem-sync: Real-time document sync and awareness server
//!
//! Keeps many clients editing the same document convergent and spreads their
//! ephemeral presence, over WebSocket, using the y-protocols sync/awareness
//! framing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer                   │
//! │ (per user)  │   sync + awareness  │  http ─► ConnectionGate      │
//! └──────┬──────┘                     │            │                 │
//!        │                            │            ▼                 │
//!        ▼                            │  SessionRegistry             │
//! ┌─────────────┐                     │   └─ Session (per document)  │
//! │ Yrs Doc     │                     │       ├─ ReplicatedDoc       │
//! │ (local)     │                     │       ├─ AwarenessTable      │
//! └─────────────┘                     │       └─ ConnectionSet       │
//!                                     └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: varint message framing (sync steps, awareness)
//! - [`document`]: replicated document capability and its Yrs backing
//! - [`awareness`]: presence table with clock-based conflict rules
//! - [`broadcast`]: per-session fan-out with eviction of dead peers
//! - [`session`]: one document's replica, presence and membership
//! - [`registry`]: document name → session, with idle eviction
//! - [`auth`]: bearer token verification
//! - [`http`]: axum routes for the health check and the WebSocket upgrade
//! - [`server`]: listener and per-connection state machine
//! - [`client`]: WebSocket sync client

pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use auth::{Claims, ClientIdentity, ConnectionGate};
pub use awareness::{AwarenessChange, AwarenessTable, AwarenessUpdate, ClientId};
pub use broadcast::{BroadcastReport, BroadcastStats, ConnectionId, ConnectionSet, Frame};
pub use client::{SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use document::{AppliedUpdate, ReplicatedDoc, YrsDocument};
pub use error::{
    AuthError, ClientError, DeliveryError, DocError, ProtocolError, ServerError, ServerResult,
};
pub use protocol::{Message, SyncMessage};
pub use registry::SessionRegistry;
pub use server::{ConnectionState, ServerStats, SyncServer, AUTH_FAILURE_CLOSE_CODE};
pub use session::{Session, Subscription};
