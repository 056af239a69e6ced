// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Minimal control-plane client for CLI commands.
//!
//! Connects over WebSocket, performs the `connect` handshake as an
//! operator with the scopes the command needs, then issues one request
//! at a time. Loopback gateways require no token; remote ones take
//! `--token` / `PORTER_TOKEN`.

use anyhow::{bail, Context};
use futures::{SinkExt, StreamExt};
use porter_proto::{
    frame, ClientInfo, ConnectAuth, ConnectParams, ErrorCode, Frame, Role, Scope,
    PROTOCOL_VERSION,
};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Error kind the CLI maps to exit code 3.
#[derive(Debug, thiserror::Error)]
#[error("authentication failed: {0}")]
pub struct AuthFailed(pub String);

pub struct ControlClient {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    next_id: u64,
}

impl ControlClient {
    /// Connect and complete the handshake.
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        scopes: Vec<Scope>,
    ) -> anyhow::Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("connecting to {url} (is the gateway running?)"))?;
        let mut client = Self { ws, next_id: 0 };

        let params = ConnectParams {
            client: ClientInfo {
                id: "porter-cli".into(),
                display_name: Some("porter CLI".into()),
                version: Some(env!("CARGO_PKG_VERSION").into()),
                mode: None,
                platform: Some(std::env::consts::OS.into()),
            },
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            auth: token.map(|t| ConnectAuth {
                token: Some(t.to_string()),
                password: None,
            }),
            role: Some(Role::Operator),
            scope: Some(scopes),
            device_id: None,
        };

        match client.call("connect", serde_json::to_value(&params)?).await {
            Ok(_) => Ok(client),
            Err(e) => match e.downcast_ref::<RequestError>() {
                Some(re) if re.code == ErrorCode::Unauthorized => {
                    bail!(AuthFailed(re.message.clone()))
                }
                _ => Err(e),
            },
        }
    }

    /// Issue one request and await its response payload.
    pub async fn call(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let req = Frame::Req {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        self.ws
            .send(Message::Text(frame::encode(&req)?))
            .await
            .context("sending request")?;

        loop {
            let msg = self
                .ws
                .next()
                .await
                .context("connection closed")?
                .context("reading response")?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Ping(data) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                    continue;
                }
                Message::Close(_) => bail!("connection closed by gateway"),
                _ => continue,
            };
            match frame::decode(&text)? {
                Frame::Res {
                    id: res_id,
                    ok,
                    payload,
                    error,
                } if res_id == id => {
                    if ok {
                        return Ok(payload.unwrap_or(Value::Null));
                    }
                    let err = error.map(|e| RequestError {
                        code: e.code,
                        message: e.message,
                    });
                    bail!(err.unwrap_or(RequestError {
                        code: ErrorCode::Internal,
                        message: "error response without error body".into(),
                    }));
                }
                // Events and unrelated responses while waiting: skip.
                _ => continue,
            }
        }
    }
}

/// A typed error response from the gateway.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}
