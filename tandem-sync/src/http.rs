//! HTTP routes of the listener.
//!
//! One axum router serves both the liveness check and the sync endpoint:
//!
//! ```text
//! GET /health                       200 "okay"
//! GET /                             200 "okay" (400 if it asks for an upgrade)
//! GET /{document}?token=<jwt>       WebSocket upgrade into a sync connection
//! ```
//!
//! The document name is the percent-decoded path without its leading `/`
//! and may itself contain slashes (`/workspace/src/main.rs`).

use std::net::SocketAddr;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::document::ReplicatedDoc;
use crate::server::{self, ServerState, StatsCounters};

/// Body of the liveness response.
pub const HEALTH_BODY: &str = "okay";

/// Query parameters of a sync connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

impl ConnectParams {
    /// Bearer token, if a non-empty one was supplied.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Document name from a captured path, `None` when nothing names one.
pub fn document_name(path: &str) -> Option<&str> {
    let name = path.trim_start_matches('/');
    (!name.is_empty()).then_some(name)
}

pub(crate) fn router<D: ReplicatedDoc + Default>(state: ServerState<D>) -> Router {
    Router::new()
        .route("/health", get(health::<D>))
        .route("/", get(root::<D>))
        .route("/{*document}", get(sync_document::<D>))
        .with_state(state)
}

async fn health<D: ReplicatedDoc>(State(state): State<ServerState<D>>) -> &'static str {
    StatsCounters::bump(&state.stats.health_checks);
    HEALTH_BODY
}

async fn root<D: ReplicatedDoc>(
    State(state): State<ServerState<D>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(_) => {
            log::debug!("Refusing upgrade without a document name");
            (StatusCode::BAD_REQUEST, "missing document name").into_response()
        }
        Err(_) => health(State(state)).await.into_response(),
    }
}

async fn sync_document<D: ReplicatedDoc + Default>(
    ws: WebSocketUpgrade,
    Path(path): Path<String>,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<ServerState<D>>,
) -> Response {
    let Some(document) = document_name(&path).map(str::to_string) else {
        log::debug!("Refusing upgrade from {addr} without a document name");
        return (StatusCode::BAD_REQUEST, "missing document name").into_response();
    };
    let token = params.token().map(str::to_string);

    log::debug!("Upgrading {addr} for '{document}'");
    ws.on_upgrade(move |socket| server::handle_socket(socket, addr, document, token, state))
}
