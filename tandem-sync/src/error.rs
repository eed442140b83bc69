//! Error taxonomy for the sync server.
//!
//! Each failure class is handled at the layer that detects it:
//!
//! | Error           | Detected by            | Effect                               |
//! |-----------------|------------------------|--------------------------------------|
//! | `AuthError`     | `ConnectionGate`       | socket closed with the auth close code |
//! | `ProtocolError` | codec / `Session`      | offending frame dropped, conn stays up |
//! | `DeliveryError` | `ConnectionSet`        | peer evicted, fan-out continues      |
//! | `ServerError`   | listener / transport   | connection (or server) shuts down    |
//! | `ClientError`   | `SyncClient`           | returned to the caller               |

use thiserror::Error;

/// Result alias for listener and transport operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Token verification failed at the connection gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("no signing secret configured and development mode is disabled")]
    NoSecret,
}

/// A frame or payload could not be decoded or applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected end of frame")]
    UnexpectedEof,

    #[error("varint does not fit in 64 bits")]
    VarIntOverflow,

    #[error("unknown message kind {0}")]
    UnknownMessageKind(u64),

    #[error("unknown sync step {0}")]
    UnknownSyncStep(u64),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("invalid awareness state for client {client_id}: {reason}")]
    InvalidAwarenessState { client_id: u64, reason: String },

    #[error("document rejected payload: {0}")]
    Document(#[from] DocError),
}

/// The replicated document refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocError {
    #[error("malformed state vector: {0}")]
    StateVector(String),

    #[error("malformed update: {0}")]
    Update(String),

    #[error("update could not be applied: {0}")]
    Apply(String),
}

/// A frame could not be handed to a peer's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("peer outbound queue is full")]
    QueueFull,

    #[error("peer is disconnected")]
    Disconnected,
}

/// Listener, transport and configuration failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failures surfaced by [`crate::client::SyncClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
