//! WebSocket sync client.
//!
//! Keeps a local Yrs replica in step with a session on the server:
//! - sends its state vector on connect and applies the server's Step2
//! - answers the server's Step1 with whatever the server is missing
//! - ships local edits as incremental updates
//! - publishes and clears its own awareness entry
//!
//! Edits made while disconnected stay in the local replica and reach the
//! server through the Step1/Step2 exchange on the next connect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use yrs::TransactionMut;

use crate::awareness::{AwarenessChange, AwarenessUpdate, ClientId};
use crate::broadcast::ConnectionId;
use crate::document::{ReplicatedDoc, YrsDocument};
use crate::error::ClientError;
use crate::protocol::{Message, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost; `code` is the close code the server sent, if any
    Disconnected { code: Option<u16> },
    /// Server answered our Step1 and the diff was applied
    StateSynced,
    /// Remote update applied to the local replica
    RemoteUpdate(Vec<u8>),
    /// Awareness delta or snapshot from the server
    Awareness(AwarenessUpdate),
}

/// The sync client.
pub struct SyncClient {
    /// Local replica
    doc: Arc<Mutex<YrsDocument>>,

    /// Awareness client id (the replica's Yrs client id)
    client_id: ClientId,

    /// Clock of our own awareness entry
    awareness_clock: AtomicU64,

    state: Arc<RwLock<ConnectionState>>,

    /// Bumped on every connect; a reader task only reports on its own connection
    generation: Arc<AtomicU64>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Dropping this closes the socket
    close_tx: Option<oneshot::Sender<()>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,

    server_url: String,
    document: String,
    token: Option<String>,
}

impl SyncClient {
    /// Create a client for `document` on the server at `server_url` (`ws://host:port`).
    pub fn new(server_url: impl Into<String>, document: impl Into<String>) -> Self {
        let doc = YrsDocument::new();
        let client_id = doc.doc().client_id();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            doc: Arc::new(Mutex::new(doc)),
            client_id,
            awareness_clock: AtomicU64::new(0),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            close_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
            document: document.into(),
            token: None,
        }
    }

    /// Present `token` as the bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Full connection URL including document path and token.
    pub fn url(&self) -> String {
        let base = format!("{}/{}", self.server_url.trim_end_matches('/'), self.document);
        match &self.token {
            Some(token) => format!("{base}?token={token}"),
            None => base,
        }
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.url()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        // Writer task: forward the outgoing channel until asked to close
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = out_rx.recv() => {
                        let Some(data) = data else { break };
                        if ws_writer.send(WsMessage::Binary(data.into())).await.is_err() {
                            return;
                        }
                    }
                    _ = &mut close_rx => break,
                }
            }
            let _ = ws_writer.close().await;
        });

        // Our state vector, so the server can send what we lack
        let step1 = Message::step1(self.doc.lock().state_vector()).encode();
        out_tx
            .send(step1)
            .await
            .map_err(|_| ClientError::NotConnected)?;

        self.outgoing_tx = Some(out_tx.clone());
        self.close_tx = Some(close_tx);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);

        // Reader task: integrate incoming frames
        let doc = self.doc.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current = self.generation.clone();
        let server = ConnectionId::new();
        tokio::spawn(async move {
            let mut close_code = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => {
                        match handle_frame(&doc, server, &out_tx, &data).await {
                            Ok(Some(event)) => {
                                if event_tx.try_send(event).is_err() {
                                    log::debug!("Event receiver full or gone; dropping event");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Dropping frame from server: {e}"),
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            if current.load(Ordering::SeqCst) == generation {
                *state.write().await = ConnectionState::Disconnected;
            }
            let _ = event_tx.try_send(SyncEvent::Disconnected { code: close_code });
        });

        Ok(())
    }

    /// Close the connection. The local replica is kept.
    pub async fn disconnect(&mut self) {
        // The writer task sends a close frame once the signal is dropped.
        self.close_tx = None;
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Apply a local edit and send the resulting update.
    ///
    /// While disconnected the edit is kept locally and synced on reconnect.
    pub async fn edit<F>(&self, mutate: F) -> Result<Vec<u8>, ClientError>
    where
        F: FnOnce(&mut TransactionMut<'_>),
    {
        let update = self.doc.lock().produce_update(mutate);
        if *self.state.read().await == ConnectionState::Connected {
            self.send(Message::update(update.clone()).encode()).await?;
        }
        Ok(update)
    }

    /// Publish our presence (a JSON object).
    pub async fn set_awareness(&self, state: impl Into<String>) -> Result<(), ClientError> {
        let clock = self.awareness_clock.fetch_add(1, Ordering::SeqCst) + 1;
        let change = AwarenessChange::set(self.client_id, clock, state);
        self.send_awareness(change).await
    }

    /// Withdraw our presence.
    pub async fn clear_awareness(&self) -> Result<(), ClientError> {
        let clock = self.awareness_clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.send_awareness(AwarenessChange::removal(self.client_id, clock))
            .await
    }

    async fn send_awareness(&self, change: AwarenessChange) -> Result<(), ClientError> {
        let payload = AwarenessUpdate::new(vec![change]).encode();
        self.send(Message::awareness(payload).encode()).await
    }

    /// Send a raw, already encoded frame.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(frame).await.map_err(|_| ClientError::NotConnected)
    }

    /// Read the local replica.
    pub fn with_doc<R>(&self, read: impl FnOnce(&YrsDocument) -> R) -> R {
        read(&self.doc.lock())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().state_vector()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

async fn handle_frame(
    doc: &Mutex<YrsDocument>,
    server: ConnectionId,
    out_tx: &mpsc::Sender<Vec<u8>>,
    data: &[u8],
) -> Result<Option<SyncEvent>, ClientError> {
    let event = match Message::decode(data)? {
        Message::Sync(SyncMessage::Step1(state_vector)) => {
            let diff = doc
                .lock()
                .diff_since(&state_vector)
                .map_err(crate::error::ProtocolError::from)?;
            out_tx
                .send(Message::step2(diff).encode())
                .await
                .map_err(|_| ClientError::NotConnected)?;
            None
        }
        Message::Sync(SyncMessage::Step2(update)) => {
            apply(doc, &update, server)?;
            Some(SyncEvent::StateSynced)
        }
        Message::Sync(SyncMessage::Update(update)) => {
            apply(doc, &update, server)?;
            Some(SyncEvent::RemoteUpdate(update))
        }
        Message::Awareness(payload) => Some(SyncEvent::Awareness(AwarenessUpdate::decode(&payload)?)),
    };
    Ok(event)
}

fn apply(doc: &Mutex<YrsDocument>, update: &[u8], origin: ConnectionId) -> Result<(), ClientError> {
    doc.lock()
        .apply_remote_update(update, origin)
        .map_err(crate::error::ProtocolError::from)?;
    Ok(())
}
