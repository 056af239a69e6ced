// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Control-plane method dispatch.
//!
//! Every authenticated `req` frame lands here. The dispatcher checks the
//! connection's scopes, deserializes the typed params, talks to the
//! subsystem that owns the state, and produces exactly one `res` frame.
//! Method handlers never touch the socket — the connection task owns I/O.
//!
//! | method             | scope       |
//! |--------------------|-------------|
//! | `chat.*`           | write/read  |
//! | `node.invoke`      | admin       |
//! | `approval.*`       | approvals   |
//! | `pairing.*`        | pairing     |
//! | `voicewake.*`      | read/write  |
//! | `gateway.status`   | read        |
//! | `gateway.stop`     | admin       |
//! | `channel.inbound`  | plugin role |

use std::sync::Arc;
use std::time::Instant;

use porter_config::Config;
use porter_core::{CancelReason, KeyResolver, PeerAddress, Scheduler, SessionKey};
use porter_exec::{ExecPlane, ResolveError};
use porter_proto::{
    methods::event, ChatAbortParams, ChatHistoryParams, ChatHistoryResult, ChatInjectParams,
    ChatSendParams, ChatSendResult, ErrorCode, Frame, NodeInvokeParams, PairingActParams,
    PairingListParams, PairingListResult, ApprovalListResult, ApprovalResolveParams, Role, Scope,
    Target,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audit::AuditLog;
use crate::outbound::OutboundRouter;
use crate::pairing::{GateDecision, PairingStore};
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use crate::voicewake::VoicewakeStore;

const DEFAULT_AGENT: &str = "default";

/// Everything method handlers need. One per gateway, shared by all
/// connection tasks.
pub struct Dispatcher {
    pub config: std::sync::RwLock<Arc<Config>>,
    pub resolver: std::sync::RwLock<Arc<KeyResolver>>,
    pub scheduler: Scheduler,
    pub registry: Arc<ConnectionRegistry>,
    pub pairing: Arc<PairingStore>,
    pub plane: Arc<ExecPlane>,
    pub router: Arc<OutboundRouter>,
    pub voicewake: Arc<VoicewakeStore>,
    pub audit: Arc<AuditLog>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl Dispatcher {
    /// Swap config-derived state on hot reload. Live sessions keep their
    /// snapshots; only new resolutions observe the change.
    pub fn update_config(&self, config: Arc<Config>) {
        *self.resolver.write().unwrap() = Arc::new(KeyResolver::from_config(&config));
        self.scheduler.update_config(config.clone());
        self.plane.update_config(config.clone());
        self.pairing.update_config(config.clone());
        self.router.update_config(config.clone());
        *self.config.write().unwrap() = config;
    }

    /// Handle one request frame, producing the response frame.
    pub async fn handle(&self, conn: &ConnectionInfo, id: String, method: &str, params: Value) -> Frame {
        debug!(conn = %conn.id, method, "request");
        match method {
            "chat.send" => self.chat_send(conn, id, params).await,
            "chat.abort" => self.chat_abort(conn, id, params).await,
            "chat.inject" => self.chat_inject(conn, id, params).await,
            "chat.history" => self.chat_history(conn, id, params).await,
            "node.invoke" => self.node_invoke(conn, id, params).await,
            "approval.list" => self.approval_list(conn, id).await,
            "approval.resolve" => self.approval_resolve(conn, id, params).await,
            "pairing.list" => self.pairing_list(conn, id, params).await,
            "pairing.approve" => self.pairing_act(conn, id, params, true).await,
            "pairing.deny" => self.pairing_act(conn, id, params, false).await,
            "voicewake.get" => self.voicewake_get(conn, id).await,
            "voicewake.set" => self.voicewake_set(conn, id, params).await,
            "gateway.status" => self.gateway_status(conn, id).await,
            "gateway.stop" => self.gateway_stop(conn, id).await,
            "channel.inbound" => self.channel_inbound(conn, id, params).await,
            other => Frame::err(
                id,
                ErrorCode::UnknownMethod,
                format!("unknown method '{other}'"),
            ),
        }
    }

    fn require(&self, conn: &ConnectionInfo, scope: Scope, id: &str) -> Option<Frame> {
        if conn.has_scope(scope) || conn.has_scope(Scope::Admin) {
            None
        } else {
            Some(Frame::err(
                id.to_string(),
                ErrorCode::Unauthorized,
                format!("missing scope {scope:?}"),
            ))
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(id: &str, params: Value) -> Result<T, Frame> {
        // An absent params field decodes as null; treat it as `{}` so
        // methods whose params are all optional accept a bare request.
        let params = if params.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            params
        };
        serde_json::from_value(params).map_err(|e| {
            Frame::err(
                id.to_string(),
                ErrorCode::InvalidRequest,
                format!("invalid params: {e}"),
            )
        })
    }

    async fn session_agent(&self, key: &SessionKey) -> String {
        self.scheduler
            .store()
            .get(key)
            .await
            .map(|m| m.agent)
            .unwrap_or_else(|| DEFAULT_AGENT.to_string())
    }

    fn resolve_target(&self, target: &Target) -> SessionKey {
        let resolver = self.resolver.read().unwrap().clone();
        resolver.resolve(&PeerAddress::from(target.clone()))
    }

    // ── chat.* ────────────────────────────────────────────────────────────────

    async fn chat_send(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Write, &id) {
            return denied;
        }
        let p: ChatSendParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };

        let key = match (&p.session_key, &p.target) {
            (Some(raw), _) => SessionKey::from_raw(raw),
            (None, Some(target)) => self.resolve_target(target),
            (None, None) => {
                return Frame::err(
                    id,
                    ErrorCode::InvalidRequest,
                    "either sessionKey or target is required",
                )
            }
        };

        let agent = self.session_agent(&key).await;
        let run_id = self
            .scheduler
            .submit(&key, &agent, p.message, p.thinking, Some(&p.idempotency_key))
            .await;

        // The caller observes this run's events on the session topic.
        self.registry
            .subscribe(conn.id, format!("session:{key}"))
            .await;

        Frame::ok(
            id,
            serde_json::to_value(ChatSendResult {
                run_id,
                status: "started".into(),
            })
            .unwrap_or(Value::Null),
        )
    }

    async fn chat_abort(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Write, &id) {
            return denied;
        }
        let p: ChatAbortParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };
        if self.scheduler.cancel(&p.run_id, CancelReason::Cancelled).await {
            Frame::ok(id, json!({"ok": true}))
        } else {
            Frame::err(id, ErrorCode::NotFound, "unknown run id")
        }
    }

    async fn chat_inject(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Write, &id) {
            return denied;
        }
        let p: ChatInjectParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };
        let key = SessionKey::from_raw(&p.session_key);
        let agent = self.session_agent(&key).await;
        match self.scheduler.inject(&key, &agent, &p.text).await {
            Ok(()) => Frame::ok(id, json!({"ok": true})),
            Err(e) => Frame::err(id, ErrorCode::Internal, e.to_string()),
        }
    }

    async fn chat_history(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Read, &id) {
            return denied;
        }
        let p: ChatHistoryParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };
        let key = SessionKey::from_raw(&p.session_key);
        let agent = self.session_agent(&key).await;
        match self.scheduler.transcript().tail(&agent, &key, p.limit) {
            Ok(entries) => Frame::ok(
                id,
                serde_json::to_value(ChatHistoryResult { entries }).unwrap_or(Value::Null),
            ),
            Err(e) => Frame::err(id, ErrorCode::Internal, e.to_string()),
        }
    }

    // ── node.invoke ───────────────────────────────────────────────────────────

    async fn node_invoke(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Admin, &id) {
            return denied;
        }
        let p: NodeInvokeParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };
        match self.registry.invoke_node(&p.node_id, &p.command, p.args).await {
            Ok(result) => Frame::ok(id, json!({"ok": true, "result": result})),
            Err(e) => Frame::err(id, e.code, e.message),
        }
    }

    // ── approval.* ────────────────────────────────────────────────────────────

    async fn approval_list(&self, conn: &ConnectionInfo, id: String) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Approvals, &id) {
            return denied;
        }
        let entries = self.plane.list_approvals();
        Frame::ok(
            id,
            serde_json::to_value(ApprovalListResult { entries }).unwrap_or(Value::Null),
        )
    }

    async fn approval_resolve(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Approvals, &id) {
            return denied;
        }
        let p: ApprovalResolveParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };
        match self
            .plane
            .resolve_approval(&p.approval_id, p.decision, &conn.device_id)
        {
            Ok(entry) => {
                self.audit.record(
                    &conn.device_id,
                    "approval.resolve",
                    &p.approval_id,
                    Some(&format!("{:?} {}", p.decision, entry.command)),
                );
                Frame::ok(id, json!({"ok": true}))
            }
            Err(ResolveError::AlreadyResolved) => Frame::err(
                id,
                ErrorCode::AlreadyResolved,
                "approval was already resolved",
            ),
            Err(ResolveError::NotFound) => {
                Frame::err(id, ErrorCode::NotFound, "unknown approval id")
            }
        }
    }

    // ── pairing.* ─────────────────────────────────────────────────────────────

    async fn pairing_list(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Pairing, &id) {
            return denied;
        }
        let p: PairingListParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };
        let entries = self.pairing.list(p.channel.as_deref());
        Frame::ok(
            id,
            serde_json::to_value(PairingListResult { entries }).unwrap_or(Value::Null),
        )
    }

    async fn pairing_act(
        &self,
        conn: &ConnectionInfo,
        id: String,
        params: Value,
        approve: bool,
    ) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Pairing, &id) {
            return denied;
        }
        let p: PairingActParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };
        let result = if approve {
            self.pairing.approve(&p.channel, &p.sender, &conn.device_id)
        } else {
            self.pairing.deny(&p.channel, &p.sender, &conn.device_id)
        };
        match result {
            Ok(changed) => {
                if changed {
                    self.registry
                        .broadcast(
                            |c| c.role == Role::Operator && c.has_scope(Scope::Read),
                            Frame::event(
                                event::PAIRING_CHANGED,
                                json!({"channel": p.channel, "sender": p.sender}),
                            ),
                        )
                        .await;
                }
                Frame::ok(id, json!({"ok": true, "changed": changed}))
            }
            Err(e) => Frame::err(id, ErrorCode::Internal, e.to_string()),
        }
    }

    // ── voicewake.* ───────────────────────────────────────────────────────────

    async fn voicewake_get(&self, conn: &ConnectionInfo, id: String) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Read, &id) {
            return denied;
        }
        Frame::ok(
            id,
            serde_json::to_value(self.voicewake.get()).unwrap_or(Value::Null),
        )
    }

    async fn voicewake_set(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Write, &id) {
            return denied;
        }
        #[derive(serde::Deserialize)]
        struct SetParams {
            triggers: Vec<String>,
        }
        let p: SetParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };
        match self.voicewake.set(p.triggers) {
            Ok(state) => {
                self.registry
                    .broadcast(
                        |c| c.role == Role::Operator && c.has_scope(Scope::Read),
                        Frame::event(
                            event::VOICEWAKE_CHANGED,
                            serde_json::to_value(&state).unwrap_or(Value::Null),
                        ),
                    )
                    .await;
                Frame::ok(id, json!({"ok": true}))
            }
            Err(e) => Frame::err(id, ErrorCode::Internal, e.to_string()),
        }
    }

    // ── gateway.* ─────────────────────────────────────────────────────────────

    async fn gateway_status(&self, conn: &ConnectionInfo, id: String) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Read, &id) {
            return denied;
        }
        let operators = self.registry.list_by_role(Role::Operator).await.len();
        let nodes = self.registry.list_by_role(Role::Node).await.len();
        let plugins = self.registry.list_by_role(Role::ChannelPlugin).await.len();
        let sessions = self.scheduler.store().list().await.len();
        // One device may hold operator + node duals; the presence view
        // groups them while each connection stays authorized on its own.
        let devices: Vec<Value> = self
            .registry
            .devices()
            .await
            .into_iter()
            .map(|(device_id, roles)| json!({"deviceId": device_id, "roles": roles}))
            .collect();
        Frame::ok(
            id,
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "uptimeSecs": self.started_at.elapsed().as_secs(),
                "connections": {"operators": operators, "nodes": nodes, "channelPlugins": plugins},
                "devices": devices,
                "sessions": sessions,
                "activeWorkers": self.scheduler.active_workers().await,
            }),
        )
    }

    async fn gateway_stop(&self, conn: &ConnectionInfo, id: String) -> Frame {
        if let Some(denied) = self.require(conn, Scope::Admin, &id) {
            return denied;
        }
        self.audit
            .record(&conn.device_id, "gateway.stop", "gateway", None);
        self.shutdown.cancel();
        Frame::ok(id, json!({"ok": true}))
    }

    // ── channel.inbound ───────────────────────────────────────────────────────

    /// Inbound message pushed by a channel plugin: gate, resolve, debounce.
    async fn channel_inbound(&self, conn: &ConnectionInfo, id: String, params: Value) -> Frame {
        if conn.role != Role::ChannelPlugin && !conn.has_scope(Scope::Admin) {
            return Frame::err(
                id,
                ErrorCode::Unauthorized,
                "channel.inbound requires the channel-plugin role",
            );
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct InboundParams {
            channel: String,
            account: String,
            peer: porter_proto::PeerRef,
            #[serde(default)]
            thread: Option<String>,
            /// Sender identity for the pairing gate; defaults to the peer id.
            #[serde(default)]
            sender: Option<String>,
            text: String,
        }
        let p: InboundParams = match Self::parse(&id, params) {
            Ok(p) => p,
            Err(f) => return f,
        };

        let sender = p.sender.clone().unwrap_or_else(|| p.peer.id.clone());
        match self.pairing.gate(&p.channel, &sender) {
            GateDecision::Admit => {
                let key = self.resolve_target(&Target {
                    channel: p.channel.clone(),
                    account: p.account.clone(),
                    peer: p.peer.clone(),
                    thread: p.thread.clone(),
                });
                let agent = self.session_agent(&key).await;
                // "/stop" is a control signal, not a message: it forces the
                // debounce buffer to flush immediately.
                if p.text.trim() == "/stop" {
                    self.scheduler.flush(&key, &agent).await;
                    return Frame::ok(
                        id,
                        json!({"ok": true, "routed": false, "flushed": true}),
                    );
                }
                self.scheduler.inbound(&key, &agent, p.text).await;
                Frame::ok(id, json!({"ok": true, "routed": true, "sessionKey": key.as_str()}))
            }
            GateDecision::PairingCreated { code } => {
                // The code goes back on the sender's own channel; the
                // triggering message is dropped.
                let target = Target {
                    channel: p.channel.clone(),
                    account: p.account.clone(),
                    peer: p.peer.clone(),
                    thread: None,
                };
                let text = format!(
                    "Pairing required. Share this code with the gateway operator: {code}"
                );
                let (_, delivery) = self
                    .router
                    .deliver(
                        &target,
                        porter_channels::OutboundPayload::text(text),
                        None,
                    )
                    .await;
                if let Err(e) = delivery {
                    tracing::warn!(channel = %p.channel, "pairing code delivery failed: {e}");
                }
                self.registry
                    .broadcast(
                        |c| c.role == Role::Operator && c.has_scope(Scope::Pairing),
                        Frame::event(
                            event::PAIRING_CHANGED,
                            json!({"channel": p.channel, "sender": sender, "pending": true}),
                        ),
                    )
                    .await;
                Frame::ok(id, json!({"ok": true, "routed": false, "pairing": "created"}))
            }
            GateDecision::PairingPending => {
                Frame::ok(id, json!({"ok": true, "routed": false, "pairing": "pending"}))
            }
            GateDecision::Drop => Frame::ok(id, json!({"ok": true, "routed": false})),
        }
    }
}
