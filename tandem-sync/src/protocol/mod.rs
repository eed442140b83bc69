//! Binary protocol for document sync and awareness.
//!
//! Wire format (one message per WebSocket binary frame):
//! ```text
//! ┌──────────────┬───────────────────────────────────────────────┐
//! │ kind: varint │ payload                                       │
//! ├──────────────┼───────────────────────────────────────────────┤
//! │ 0 = sync     │ step: varint (0 Step1, 1 Step2, 2 Update)      │
//! │              │ data: varint length + bytes                    │
//! │ 1 = awareness│ update: varint length + bytes                  │
//! └──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! Payload bytes are opaque here: state vectors and updates belong to the
//! replicated document, awareness updates to [`crate::awareness`].

pub mod encoding;

pub use encoding::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Outer message kind tags.
pub const MESSAGE_SYNC: u64 = 0;
pub const MESSAGE_AWARENESS: u64 = 1;

/// Sync sub-protocol step tags.
pub const SYNC_STEP1: u64 = 0;
pub const SYNC_STEP2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

/// Sync sub-protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's state vector; the receiver replies with what the sender lacks
    Step1(Vec<u8>),
    /// Update computed against a received state vector
    Step2(Vec<u8>),
    /// Incremental update produced by a mutation
    Update(Vec<u8>),
}

impl SyncMessage {
    fn tag(&self) -> u64 {
        match self {
            Self::Step1(_) => SYNC_STEP1,
            Self::Step2(_) => SYNC_STEP2,
            Self::Update(_) => SYNC_UPDATE,
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            Self::Step1(d) | Self::Step2(d) | Self::Update(d) => d,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded awareness update (see [`crate::awareness::AwarenessUpdate`])
    Awareness(Vec<u8>),
}

impl Message {
    pub fn step1(state_vector: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Step1(state_vector))
    }

    pub fn step2(diff: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Step2(diff))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Update(update))
    }

    pub fn awareness(update: Vec<u8>) -> Self {
        Self::Awareness(update)
    }

    /// Outer kind tag.
    pub fn kind(&self) -> u64 {
        match self {
            Self::Sync(_) => MESSAGE_SYNC,
            Self::Awareness(_) => MESSAGE_AWARENESS,
        }
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(self.payload_len() + 8);
        enc.write_var(self.kind());
        match self {
            Self::Sync(sync) => {
                enc.write_var(sync.tag());
                enc.write_bytes(sync.data());
            }
            Self::Awareness(update) => {
                enc.write_bytes(update);
            }
        }
        enc.into_inner()
    }

    /// Deserialize a single frame. The whole frame must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        let msg = match dec.read_var()? {
            MESSAGE_SYNC => {
                let step = dec.read_var()?;
                let data = dec.read_bytes()?.to_vec();
                Self::Sync(match step {
                    SYNC_STEP1 => SyncMessage::Step1(data),
                    SYNC_STEP2 => SyncMessage::Step2(data),
                    SYNC_UPDATE => SyncMessage::Update(data),
                    other => return Err(ProtocolError::UnknownSyncStep(other)),
                })
            }
            MESSAGE_AWARENESS => Self::Awareness(dec.read_bytes()?.to_vec()),
            other => return Err(ProtocolError::UnknownMessageKind(other)),
        };
        dec.finish()?;
        Ok(msg)
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Sync(sync) => sync.data().len(),
            Self::Awareness(update) => update.len(),
        }
    }
}

impl From<SyncMessage> for Message {
    fn from(msg: SyncMessage) -> Self {
        Self::Sync(msg)
    }
}
