// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-connection task — handshake, frame pump, heartbeat.
//!
//! A fresh connection is parked unauthenticated with a short read
//! deadline: the only acceptable first frame is a `req` with method
//! `connect`. After a successful handshake the task owns the socket and
//! selects over three sources:
//!
//! - incoming WebSocket messages (requests are dispatched in spawned
//!   tasks so a handler that performs nested RPC — e.g. a pairing code
//!   delivered back through the requesting plugin — can never deadlock
//!   its own read loop),
//! - the connection's bounded outbound frame queue (responses + events),
//! - the heartbeat interval (ping every `heartbeat`; two missed pongs
//!   drop the connection).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use porter_channels::ChannelRegistry;
use porter_proto::{frame, negotiate, ConnectParams, ErrorCode, Features, Frame, HelloOk, Role};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::AuthState;
use crate::dispatch::Dispatcher;
use crate::outbound::PluginChannelAdapter;
use crate::registry::{ConnectionInfo, ConnectionRegistry};

/// How long an unauthenticated connection may sit before the `connect`
/// frame must have arrived.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Shared dependencies of every connection task.
pub struct ConnectionDeps {
    pub auth: AuthState,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ConnectionRegistry>,
    pub channels: ChannelRegistry,
    pub tunnel_identity_header: String,
    pub outbound_queue: usize,
    pub heartbeat: Duration,
    pub server_version: String,
}

/// Methods and events advertised in the `hello-ok` feature block.
fn features() -> Features {
    Features {
        methods: [
            "connect",
            "chat.send",
            "chat.abort",
            "chat.inject",
            "chat.history",
            "node.invoke",
            "approval.list",
            "approval.resolve",
            "pairing.list",
            "pairing.approve",
            "pairing.deny",
            "voicewake.get",
            "voicewake.set",
            "gateway.status",
            "gateway.stop",
            "channel.inbound",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        events: [
            "agent",
            "presence",
            "approval.requested",
            "pairing.changed",
            "voicewake.changed",
            "exec.started",
            "exec.finished",
            "exec.denied",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
}

/// Drive one accepted WebSocket to completion.
pub async fn serve_socket(
    mut socket: WebSocket,
    ip: IpAddr,
    tunnel_identity: Option<String>,
    deps: Arc<ConnectionDeps>,
) {
    // ── Handshake ─────────────────────────────────────────────────────────────
    let (req_id, params) = match read_connect(&mut socket).await {
        Some(ok) => ok,
        None => return,
    };

    if let Err(e) = negotiate(params.min_protocol, params.max_protocol) {
        let _ = send_frame(&mut socket, &Frame::err(req_id, e.code, e.message)).await;
        return;
    }

    let principal = match deps
        .auth
        .authenticate(&params, ip, tunnel_identity.as_deref())
    {
        Ok(p) => p,
        Err(e) => {
            let _ = send_frame(&mut socket, &Frame::err(req_id, e.code, e.message)).await;
            return;
        }
    };

    let hello = HelloOk::new(deps.server_version.clone(), None).with_features(features());
    let hello_frame = Frame::ok(
        req_id,
        serde_json::to_value(&hello).unwrap_or(Value::Null),
    );
    if send_frame(&mut socket, &hello_frame).await.is_err() {
        return;
    }

    // ── Register ──────────────────────────────────────────────────────────────
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(deps.outbound_queue);
    let channel = match principal.role {
        // A channel plugin serves the channel named by its client id.
        Role::ChannelPlugin => Some(params.client.id.to_lowercase()),
        _ => None,
    };
    let info = deps
        .registry
        .register(
            principal.device_id.clone(),
            principal.role,
            principal.scopes.clone(),
            params.client.display_name.clone(),
            channel.clone(),
            out_tx.clone(),
        )
        .await;

    if let Some(channel_name) = &channel {
        // Last registration wins; a reconnecting plugin replaces itself.
        deps.channels.register(Arc::new(PluginChannelAdapter::new(
            channel_name.clone(),
            deps.registry.clone(),
        )));
    }

    info!(
        conn = %info.id,
        role = ?info.role,
        device = %info.device_id,
        via = ?principal.via,
        identity = principal.identity.as_deref().unwrap_or("-"),
        "client connected"
    );

    run_frame_pump(socket, &info, &mut out_rx, out_tx, &deps).await;

    deps.registry.deregister(info.id).await;
    info!(conn = %info.id, "client disconnected");
}

/// Read frames until close, pumping the outbound queue and heartbeats.
async fn run_frame_pump(
    mut socket: WebSocket,
    info: &ConnectionInfo,
    out_rx: &mut mpsc::Receiver<Frame>,
    out_tx: mpsc::Sender<Frame>,
    deps: &Arc<ConnectionDeps>,
) {
    let mut ping = tokio::time::interval(deps.heartbeat);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ping.tick().await;
    let mut last_pong = tokio::time::Instant::now();
    let shutdown = deps.dispatcher.shutdown.clone();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, info, &out_tx, deps).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(conn = %info.id, "socket error: {e}");
                        break;
                    }
                }
            }
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame::encode(&frame) {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(conn = %info.id, "frame encode failed: {e}"),
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > deps.heartbeat * 2 {
                    warn!(conn = %info.id, "heartbeat lost, dropping connection");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

async fn handle_text(
    text: &str,
    info: &ConnectionInfo,
    out_tx: &mpsc::Sender<Frame>,
    deps: &Arc<ConnectionDeps>,
) {
    match frame::decode(text) {
        Ok(Frame::Req { id, method, params }) => {
            // Dispatch off the read loop: a handler may perform nested
            // RPC through this very connection (plugin code delivery).
            let dispatcher = deps.dispatcher.clone();
            let info = info.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let res = dispatcher.handle(&info, id, &method, params).await;
                let _ = out_tx.send(res).await;
            });
        }
        Ok(Frame::Res {
            id,
            ok,
            payload,
            error,
        }) => {
            // Answers to server-initiated requests (node invoke, plugin
            // delivery) route back through the pending-request map.
            if !deps.registry.complete_request(&id, ok, payload, error).await {
                debug!(conn = %info.id, res = %id, "response without pending request");
            }
        }
        Ok(Frame::Event { event, .. }) => {
            // Clients do not publish events; unknown ones are dropped.
            debug!(conn = %info.id, event, "client event ignored");
        }
        Err(e) => {
            let _ = out_tx
                .send(Frame::err(
                    String::new(),
                    ErrorCode::InvalidRequest,
                    format!("malformed frame: {e}"),
                ))
                .await;
        }
    }
}

/// Await the `connect` request, enforcing the handshake deadline. Any
/// other first frame closes the connection.
async fn read_connect(socket: &mut WebSocket) -> Option<(String, ConnectParams)> {
    let deadline = tokio::time::Instant::now() + HANDSHAKE_DEADLINE;
    loop {
        let msg = tokio::time::timeout_at(deadline, socket.recv()).await.ok()??;
        match msg {
            Ok(Message::Text(text)) => {
                return match frame::decode(&text) {
                    Ok(Frame::Req { id, method, params }) if method == "connect" => {
                        match serde_json::from_value::<ConnectParams>(params) {
                            Ok(p) => Some((id, p)),
                            Err(e) => {
                                let _ = send_frame(
                                    socket,
                                    &Frame::err(
                                        id,
                                        ErrorCode::InvalidRequest,
                                        format!("invalid connect params: {e}"),
                                    ),
                                )
                                .await;
                                None
                            }
                        }
                    }
                    Ok(Frame::Req { id, .. }) => {
                        let _ = send_frame(
                            socket,
                            &Frame::err(
                                id,
                                ErrorCode::Unauthorized,
                                "connect must be the first request",
                            ),
                        )
                        .await;
                        None
                    }
                    _ => None,
                };
            }
            Ok(Message::Ping(data)) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    return None;
                }
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => {} // ignore binary noise pre-handshake
            Err(_) => return None,
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame_value: &Frame) -> Result<(), axum::Error> {
    let text = frame::encode(frame_value).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}
