//! Shared helpers for end-to-end tests: a server on an ephemeral port and a
//! raw WebSocket peer that exposes every frame it receives.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use tandem_sync::{Claims, Message, ServerConfig, SyncServer, YrsDocument};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

pub const SECRET: &str = "integration-test-secret";

/// How long to wait for a frame that should arrive.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait before concluding a frame will not arrive.
pub const SILENCE: Duration = Duration::from_millis(200);

/// Start a server on an ephemeral port.
pub async fn start_server(config: ServerConfig) -> (Arc<SyncServer>, SocketAddr) {
    let server: Arc<SyncServer> = Arc::new(SyncServer::new(config.with_bind("127.0.0.1", 0)));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, addr)
}

/// Start a permissive server (no secret, development mode).
pub async fn start_dev_server() -> (Arc<SyncServer>, SocketAddr) {
    start_server(ServerConfig::default().with_dev_mode(true)).await
}

pub fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}")
}

/// Mint a token signed with `secret`, valid for an hour.
pub fn mint_token(secret: &str, sub: &str) -> String {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    let claims = Claims {
        sub: sub.to_string(),
        exp,
        name: None,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

/// Poll `check` until it holds or the receive timeout expires.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Append `chunk` to the shared text of a local document and return the update.
pub fn append(doc: &YrsDocument, chunk: &str) -> Vec<u8> {
    doc.produce_update(|txn| {
        let text = txn.get_or_insert_text("content");
        let len = text.len(&*txn);
        text.insert(txn, len, chunk);
    })
}

pub fn read_text(doc: &YrsDocument) -> String {
    let txn = Transact::transact(doc.doc());
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

/// What a raw peer observed next.
#[derive(Debug, PartialEq)]
pub enum Received {
    Frame(Message),
    Closed(Option<u16>),
    Timeout,
}

/// A bare WebSocket peer speaking the wire protocol by hand.
pub struct RawPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr, document: &str, token: Option<&str>) -> Self {
        let mut url = format!("{}/{document}", ws_url(addr));
        if let Some(token) = token {
            url.push_str(&format!("?token={token}"));
        }
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        Self { ws }
    }

    /// Connect and consume the join handshake.
    pub async fn join(addr: SocketAddr, document: &str) -> Self {
        let mut peer = Self::connect(addr, document, None).await;
        match peer.recv().await {
            Received::Frame(Message::Sync(tandem_sync::SyncMessage::Step1(_))) => {}
            other => panic!("expected Step1 handshake, got {other:?}"),
        }
        peer
    }

    pub async fn send(&mut self, message: &Message) {
        self.send_raw(message.encode()).await;
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(WsMessage::Binary(bytes.into())).await.unwrap();
    }

    pub async fn recv_within(&mut self, wait: Duration) -> Received {
        loop {
            match timeout(wait, self.ws.next()).await {
                Err(_) => return Received::Timeout,
                Ok(Some(Ok(WsMessage::Binary(data)))) => {
                    return Received::Frame(Message::decode(&data).unwrap())
                }
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    return Received::Closed(frame.map(|f| u16::from(f.code)))
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) => return Received::Closed(None),
            }
        }
    }

    pub async fn recv(&mut self) -> Received {
        self.recv_within(RECV_TIMEOUT).await
    }

    /// Receive the next frame, failing the test on anything else.
    pub async fn expect_frame(&mut self) -> Message {
        match self.recv().await {
            Received::Frame(message) => message,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    /// Assert nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        let got = self.recv_within(SILENCE).await;
        assert_eq!(got, Received::Timeout, "expected no frame");
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the server acknowledges.
        let _ = timeout(RECV_TIMEOUT, async {
            while let Some(Ok(_)) = self.ws.next().await {}
        })
        .await;
    }
}
