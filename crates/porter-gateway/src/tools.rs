// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The tool surface offered to agent turns.
//!
//! Two built-ins: `exec` (routed through the exec plane with its full
//! policy/approval machinery) and `message.send` (routed through the
//! outbound router, target authoritative). Everything else an agent might
//! want lives behind these two seams or in collaborator processes.

use std::sync::Arc;

use async_trait::async_trait;
use porter_config::{AskMode, SecurityMode};
use porter_core::{
    ToolCallRequest, ToolCallResult, ToolDispatcher, TurnEmitter, TurnEvent, SessionKey,
    SessionStore,
};
use porter_exec::{ExecPlane, ExecRequest};
use porter_model::ToolSpec;
use porter_proto::Target;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::outbound::OutboundRouter;

pub struct GatewayTools {
    plane: Arc<ExecPlane>,
    router: Arc<OutboundRouter>,
    store: Arc<SessionStore>,
}

impl GatewayTools {
    pub fn new(plane: Arc<ExecPlane>, router: Arc<OutboundRouter>, store: Arc<SessionStore>) -> Self {
        Self {
            plane,
            router,
            store,
        }
    }

    async fn agent_for(&self, session_key: &SessionKey) -> String {
        self.store
            .get(session_key)
            .await
            .map(|m| m.agent)
            .unwrap_or_else(|| "default".to_string())
    }

    async fn run_exec(
        &self,
        session_key: &SessionKey,
        call: &ToolCallRequest,
        emitter: &mut TurnEmitter,
    ) -> ToolCallResult {
        #[derive(Deserialize)]
        struct ExecArgs {
            command: String,
            #[serde(default)]
            cwd: Option<String>,
            #[serde(default)]
            host: Option<String>,
            #[serde(default)]
            security: Option<SecurityMode>,
            #[serde(default)]
            ask: Option<AskMode>,
        }

        let args: ExecArgs = match serde_json::from_value(call.args.clone()) {
            Ok(a) => a,
            Err(e) => return ToolCallResult::err(format!("invalid exec arguments: {e}")),
        };

        let request = ExecRequest {
            request_id: Uuid::new_v4().to_string(),
            session_key: session_key.clone(),
            agent: self.agent_for(session_key).await,
            command: args.command,
            cwd: args.cwd,
            env: Vec::new(),
            host: args.host,
            security: args.security,
            ask: args.ask,
        };

        let result = self
            .plane
            .execute(request, |entry| {
                emitter.emit(TurnEvent::ApprovalRequested {
                    id: entry.approval_id.clone(),
                    details: json!({
                        "command": entry.command,
                        "host": entry.host,
                        "reason": entry.reason,
                    }),
                });
            })
            .await;

        match result {
            Ok(outcome) => {
                let text = format!("[exit {}]\n{}", outcome.exit_code, outcome.output);
                if outcome.exit_code == 0 {
                    ToolCallResult::ok(text)
                } else {
                    ToolCallResult::err(text)
                }
            }
            Err(reason) => ToolCallResult::err(format!("EXEC_DENIED: {reason}")),
        }
    }

    async fn run_message_send(
        &self,
        session_key: &SessionKey,
        call: &ToolCallRequest,
        emitter: &mut TurnEmitter,
    ) -> ToolCallResult {
        #[derive(Deserialize)]
        struct SendArgs {
            target: Target,
            text: String,
        }

        let args: SendArgs = match serde_json::from_value(call.args.clone()) {
            Ok(a) => a,
            Err(e) => return ToolCallResult::err(format!("invalid message.send arguments: {e}")),
        };

        let (key, result) = self
            .router
            .deliver(
                &args.target,
                porter_channels::OutboundPayload::text(args.text),
                Some(session_key),
            )
            .await;
        match result {
            Ok(receipt) => ToolCallResult::ok(format!(
                "delivered {} message(s) to {}",
                receipt.message_ids.len().max(1),
                key
            )),
            Err(e) => {
                // Surface the failure in the turn stream; the tool error
                // below reaches the model itself.
                emitter.emit(TurnEvent::Lifecycle {
                    kind: porter_core::LifecycleKind::DeliveryFailed,
                    detail: Some(format!("to {key}: {e}")),
                });
                ToolCallResult::err(format!("delivery failed: {e}"))
            }
        }
    }
}

#[async_trait]
impl ToolDispatcher for GatewayTools {
    fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "exec".into(),
                description: "Run a shell command on the configured exec host. \
                              Output is capped; commands may require operator approval."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "Shell command to run"},
                        "cwd": {"type": "string", "description": "Working directory (optional)"},
                        "host": {"type": "string", "description": "sandbox | gateway | node:<id> (optional)"}
                    },
                    "required": ["command"]
                }),
            },
            ToolSpec {
                name: "message.send".into(),
                description: "Send a message to a peer on a channel. The target is \
                              delivered exactly as addressed."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "target": {
                            "type": "object",
                            "properties": {
                                "channel": {"type": "string"},
                                "account": {"type": "string"},
                                "peer": {
                                    "type": "object",
                                    "properties": {
                                        "kind": {"type": "string", "enum": ["dm", "group", "channel", "voice"]},
                                        "id": {"type": "string"}
                                    },
                                    "required": ["kind", "id"]
                                }
                            },
                            "required": ["channel", "account", "peer"]
                        },
                        "text": {"type": "string"}
                    },
                    "required": ["target", "text"]
                }),
            },
        ]
    }

    async fn dispatch(
        &self,
        session_key: &SessionKey,
        _run_id: &str,
        call: ToolCallRequest,
        emitter: &mut TurnEmitter,
    ) -> ToolCallResult {
        match call.name.as_str() {
            "exec" => self.run_exec(session_key, &call, emitter).await,
            "message.send" => self.run_message_send(session_key, &call, emitter).await,
            other => ToolCallResult::err(format!("unknown tool: {other}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
