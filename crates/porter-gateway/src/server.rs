// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The control-plane listener — one HTTP endpoint upgrading to WebSocket.
//!
//! No TLS in-process: loopback needs none, LAN mode is protected by the
//! shared token/password inside the handshake, and tunnel mode fronts TLS
//! (and identity) externally. The tunnel's identity header is captured at
//! upgrade time and handed to the handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connection::{serve_socket, ConnectionDeps};

/// Serve the control plane until `shutdown` fires.
pub async fn serve(
    bind: SocketAddr,
    deps: Arc<ConnectionDeps>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(deps);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "control plane listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(deps): State<Arc<ConnectionDeps>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let tunnel_identity = headers
        .get(deps.tunnel_identity_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    ws.on_upgrade(move |socket| serve_socket(socket, addr.ip(), tunnel_identity, deps))
}

/// Liveness probe for supervisors and the CLI `status` fallback.
async fn healthz() -> impl IntoResponse {
    "ok"
}
