// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The exec plane: policy → authorization → (approval) → host dispatch.
//!
//! The plane publishes [`ExecEvent`]s on a broadcast stream; the gateway
//! fans them out as wire events (`exec.started` / `exec.finished` /
//! `exec.denied` / `approval.requested`) and mirrors them into the
//! session's system-event ring so the next turn sees the outcome without
//! re-reading the tool reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use porter_config::{AskMode, Config, SecurityMode};
use porter_core::SessionKey;
use porter_proto::{ApprovalDecision, ApprovalEntry};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::approval::{ApprovalTable, ResolveError};
use crate::policy::{authorize, resolve_binary, resolve_policy, Authorization, ExecHost};
use crate::runner::{GatewayRunner, RunOutcome};
use crate::store::ExecStore;

/// One exec tool invocation, as received from the agent driver.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub request_id: String,
    pub session_key: SessionKey,
    pub agent: String,
    pub command: String,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    /// Tool-call parameter overrides (highest precedence).
    pub host: Option<String>,
    pub security: Option<SecurityMode>,
    pub ask: Option<AskMode>,
}

/// Lifecycle events the plane publishes.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    ApprovalRequested { entry: ApprovalEntry },
    Started {
        request_id: String,
        session_key: String,
        command: String,
        host: String,
    },
    Finished {
        request_id: String,
        session_key: String,
        code: i32,
    },
    Denied {
        request_id: String,
        session_key: String,
        reason: String,
    },
}

/// External runner for the `sandbox` host (a container supervisor, a
/// microVM pool — the gateway does not care).
#[async_trait]
pub trait HostRunner: Send + Sync {
    async fn run(&self, req: &ExecRequest) -> RunOutcome;
}

/// Forwards `system.run` invocations to a connected node. Implemented by
/// the gateway's connection registry.
#[async_trait]
pub trait NodeInvoker: Send + Sync {
    async fn invoke(&self, node_id: &str, command: &str, args: Value) -> anyhow::Result<Value>;
}

pub struct ExecPlane {
    config: std::sync::RwLock<Arc<Config>>,
    store: ExecStore,
    approvals: ApprovalTable,
    events: broadcast::Sender<ExecEvent>,
    gateway: GatewayRunner,
    sandbox: std::sync::RwLock<Option<Arc<dyn HostRunner>>>,
    nodes: std::sync::RwLock<Option<Arc<dyn NodeInvoker>>>,
}

impl ExecPlane {
    pub fn new(config: Arc<Config>, store: ExecStore) -> Self {
        let (events, _) = broadcast::channel(256);
        let gateway = GatewayRunner {
            output_cap: config.exec.output_cap_bytes,
            output_tail: config.exec.output_tail_bytes,
            ..Default::default()
        };
        Self {
            config: std::sync::RwLock::new(config),
            store,
            approvals: ApprovalTable::new(),
            events,
            gateway,
            sandbox: std::sync::RwLock::new(None),
            nodes: std::sync::RwLock::new(None),
        }
    }

    pub fn update_config(&self, config: Arc<Config>) {
        *self.config.write().unwrap() = config;
    }

    pub fn set_sandbox(&self, runner: Arc<dyn HostRunner>) {
        *self.sandbox.write().unwrap() = Some(runner);
    }

    pub fn set_node_invoker(&self, invoker: Arc<dyn NodeInvoker>) {
        *self.nodes.write().unwrap() = Some(invoker);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecEvent> {
        self.events.subscribe()
    }

    /// Pending approvals, for `approval.list`.
    pub fn list_approvals(&self) -> Vec<ApprovalEntry> {
        self.approvals.list()
    }

    /// Operator resolution, for `approval.resolve`. First valid resolution
    /// wins; replays get [`ResolveError::AlreadyResolved`].
    pub fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        resolved_by: &str,
    ) -> Result<ApprovalEntry, ResolveError> {
        self.approvals.resolve(approval_id, decision, resolved_by)
    }

    /// Run one exec request through the full plane.
    ///
    /// `on_approval` fires synchronously when an approval is posted so the
    /// calling tool dispatcher can mirror it into the turn's event stream.
    pub async fn execute(
        &self,
        req: ExecRequest,
        mut on_approval: impl FnMut(&ApprovalEntry) + Send,
    ) -> Result<RunOutcome, String> {
        let config = self.config.read().unwrap().clone();
        let agent_cfg = config.agent(&req.agent);
        let policy = resolve_policy(
            req.host.as_deref(),
            req.security,
            req.ask,
            &agent_cfg,
            &config.exec,
        );
        let host = policy.host.to_string();
        let binary = resolve_binary(&req.command, std::env::var("PATH").ok().as_deref());
        let allowlisted = self.store.matches(&req.agent, &host, &binary);

        match authorize(&policy, allowlisted) {
            Authorization::Denied { reason } => {
                return Err(self.deny(&req, reason));
            }
            Authorization::NeedsApproval { reason } => {
                let ttl_ms = (config.exec.approval_timeout_secs as i64) * 1000;
                let (entry, rx) = self.approvals.request(
                    req.session_key.as_str(),
                    &req.command,
                    &host,
                    &reason,
                    ttl_ms,
                );
                let _ = self.events.send(ExecEvent::ApprovalRequested {
                    entry: entry.clone(),
                });
                on_approval(&entry);
                info!(approval = %entry.approval_id, command = %req.command, "approval requested");

                let timeout = Duration::from_secs(config.exec.approval_timeout_secs);
                let decision = tokio::select! {
                    d = rx => d.ok(),
                    _ = tokio::time::sleep(timeout) => {
                        self.approvals.expire(&entry.approval_id);
                        None
                    }
                };

                match decision {
                    Some(ApprovalDecision::AllowOnce) => {}
                    Some(ApprovalDecision::AllowAndAdd) => {
                        let pattern = if binary.is_empty() {
                            req.command.clone()
                        } else {
                            binary.clone()
                        };
                        if let Err(e) = self.store.add_entry(&req.agent, &pattern, Some(&host)) {
                            warn!("allowlist append failed: {e}");
                        }
                    }
                    Some(ApprovalDecision::Deny) => {
                        return Err(self.deny(&req, "approval denied".into()));
                    }
                    None => {
                        return Err(self.deny(&req, "approval timed out".into()));
                    }
                }
            }
            Authorization::Allowed => {}
        }

        let _ = self.events.send(ExecEvent::Started {
            request_id: req.request_id.clone(),
            session_key: req.session_key.to_string(),
            command: req.command.clone(),
            host: host.clone(),
        });

        let outcome = self.dispatch(&policy.host, &req).await;

        let _ = self.events.send(ExecEvent::Finished {
            request_id: req.request_id.clone(),
            session_key: req.session_key.to_string(),
            code: outcome.exit_code,
        });
        Ok(outcome)
    }

    fn deny(&self, req: &ExecRequest, reason: String) -> String {
        let _ = self.events.send(ExecEvent::Denied {
            request_id: req.request_id.clone(),
            session_key: req.session_key.to_string(),
            reason: reason.clone(),
        });
        info!(command = %req.command, %reason, "exec denied");
        reason
    }

    async fn dispatch(&self, host: &ExecHost, req: &ExecRequest) -> RunOutcome {
        match host {
            ExecHost::Gateway => {
                self.gateway
                    .run(&req.command, req.cwd.as_deref(), &req.env)
                    .await
            }
            ExecHost::Sandbox => {
                let runner = self.sandbox.read().unwrap().clone();
                match runner {
                    Some(r) => r.run(req).await,
                    None => RunOutcome {
                        exit_code: -1,
                        output: "no sandbox runner attached".into(),
                        truncated: false,
                    },
                }
            }
            ExecHost::Node(node_id) => {
                let invoker = self.nodes.read().unwrap().clone();
                let Some(invoker) = invoker else {
                    return RunOutcome {
                        exit_code: -1,
                        output: format!("node '{node_id}' is not connected"),
                        truncated: false,
                    };
                };
                let args = json!({
                    "command": req.command,
                    "cwd": req.cwd,
                    "env": req.env.iter().cloned().collect::<std::collections::HashMap<_, _>>(),
                });
                match invoker.invoke(node_id, "system.run", args).await {
                    Ok(value) => {
                        let code =
                            value.get("code").and_then(Value::as_i64).unwrap_or(-1) as i32;
                        let output = value
                            .get("output")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let config = self.config.read().unwrap().clone();
                        let (output, truncated) = crate::runner::cap_output(
                            &output,
                            config.exec.output_cap_bytes,
                            config.exec.output_tail_bytes,
                        );
                        RunOutcome {
                            exit_code: code,
                            output,
                            truncated,
                        }
                    }
                    Err(e) => RunOutcome {
                        exit_code: -1,
                        output: format!("node invoke failed: {e}"),
                        truncated: false,
                    },
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn plane_with(config: Config) -> Arc<ExecPlane> {
        Arc::new(ExecPlane::new(Arc::new(config), ExecStore::in_memory()))
    }

    fn req(command: &str) -> ExecRequest {
        ExecRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_key: SessionKey::from_raw("web:default:dm:u1"),
            agent: "default".into(),
            command: command.into(),
            cwd: None,
            env: Vec::new(),
            host: Some("gateway".into()),
            security: None,
            ask: None,
        }
    }

    fn config_allowlist(ask: &str) -> Config {
        serde_json::from_str(&format!(
            r#"{{"exec": {{"host": "gateway", "security": "allowlist", "ask": "{ask}"}}}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn allowlisted_command_runs_without_approval() {
        let plane = plane_with(config_allowlist("on-miss"));
        plane.store.add_entry("default", "*", None).unwrap();

        let out = plane.execute(req("echo allowed"), |_| {}).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.output.contains("allowed"));
    }

    #[tokio::test]
    async fn miss_with_ask_off_is_denied() {
        let plane = plane_with(config_allowlist("off"));
        let mut events = plane.subscribe();

        let err = plane.execute(req("uname -a"), |_| {}).await.unwrap_err();
        assert!(err.contains("allowlist"));

        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, ExecEvent::Denied { .. }));
    }

    #[tokio::test]
    async fn security_deny_refuses_everything() {
        let config: Config = serde_json::from_str(
            r#"{"exec": {"host": "gateway", "security": "deny"}}"#,
        )
        .unwrap();
        let plane = plane_with(config);
        let err = plane.execute(req("echo hi"), |_| {}).await.unwrap_err();
        assert!(err.contains("disabled"));
    }

    #[tokio::test]
    async fn miss_with_on_miss_asks_and_allow_once_runs() {
        let plane = plane_with(config_allowlist("on-miss"));
        let plane2 = plane.clone();

        // Resolve the approval as soon as it is posted.
        let mut events = plane.subscribe();
        tokio::spawn(async move {
            loop {
                if let Ok(ExecEvent::ApprovalRequested { entry }) = events.recv().await {
                    plane2
                        .resolve_approval(&entry.approval_id, ApprovalDecision::AllowOnce, "op-1")
                        .unwrap();
                    break;
                }
            }
        });

        let mut saw_approval = false;
        let out = plane
            .execute(req("echo approved"), |_| saw_approval = true)
            .await
            .unwrap();
        assert!(saw_approval, "on_approval hook must fire");
        assert_eq!(out.exit_code, 0);
        assert!(out.output.contains("approved"));
        // allow-once must NOT touch the allowlist.
        assert!(plane.store.entries("default").is_empty());
    }

    #[tokio::test]
    async fn allow_and_add_appends_matching_entry() {
        let plane = plane_with(config_allowlist("on-miss"));
        let plane2 = plane.clone();

        let mut events = plane.subscribe();
        tokio::spawn(async move {
            loop {
                if let Ok(ExecEvent::ApprovalRequested { entry }) = events.recv().await {
                    plane2
                        .resolve_approval(&entry.approval_id, ApprovalDecision::AllowAndAdd, "op")
                        .unwrap();
                    break;
                }
            }
        });

        let out = plane.execute(req("echo again"), |_| {}).await.unwrap();
        assert_eq!(out.exit_code, 0);
        let entries = plane.store.entries("default");
        assert_eq!(entries.len(), 1, "allow-and-add must append one entry");

        // The same command is now admitted without an approval round.
        let out2 = plane.execute(req("echo again"), |_| {}).await.unwrap();
        assert_eq!(out2.exit_code, 0);
    }

    #[tokio::test]
    async fn deny_decision_blocks_execution() {
        let plane = plane_with(config_allowlist("on-miss"));
        let plane2 = plane.clone();

        let mut events = plane.subscribe();
        tokio::spawn(async move {
            loop {
                if let Ok(ExecEvent::ApprovalRequested { entry }) = events.recv().await {
                    plane2
                        .resolve_approval(&entry.approval_id, ApprovalDecision::Deny, "op")
                        .unwrap();
                    break;
                }
            }
        });

        let err = plane.execute(req("echo nope"), |_| {}).await.unwrap_err();
        assert!(err.contains("denied"));
    }

    #[tokio::test]
    async fn approval_timeout_is_deny() {
        let mut config = config_allowlist("on-miss");
        config.exec.approval_timeout_secs = 0;
        let plane = plane_with(config);

        let err = plane.execute(req("echo never"), |_| {}).await.unwrap_err();
        assert!(err.contains("timed out"));
        // The id is tombstoned: a late resolution replays as AlreadyResolved.
        assert!(plane.list_approvals().is_empty());
    }

    #[tokio::test]
    async fn replayed_resolution_is_rejected() {
        let plane = plane_with(config_allowlist("on-miss"));
        let plane2 = plane.clone();

        let (id_tx, id_rx) = tokio::sync::oneshot::channel();
        let mut events = plane.subscribe();
        tokio::spawn(async move {
            loop {
                if let Ok(ExecEvent::ApprovalRequested { entry }) = events.recv().await {
                    plane2
                        .resolve_approval(&entry.approval_id, ApprovalDecision::AllowOnce, "op-1")
                        .unwrap();
                    let _ = id_tx.send(entry.approval_id);
                    break;
                }
            }
        });

        plane.execute(req("echo once"), |_| {}).await.unwrap();
        let id = id_rx.await.unwrap();
        let err = plane
            .resolve_approval(&id, ApprovalDecision::Deny, "op-2")
            .unwrap_err();
        assert_eq!(err, ResolveError::AlreadyResolved);
    }

    #[tokio::test]
    async fn started_and_finished_events_bracket_the_run() {
        let plane = plane_with(config_allowlist("on-miss"));
        plane.store.add_entry("default", "*", None).unwrap();
        let mut events = plane.subscribe();

        plane.execute(req("echo ok"), |_| {}).await.unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert!(matches!(first, ExecEvent::Started { .. }));
        assert!(matches!(second, ExecEvent::Finished { code: 0, .. }));
    }

    #[tokio::test]
    async fn unattached_node_host_reports_error_outcome() {
        let config: Config = serde_json::from_str(
            r#"{"exec": {"host": "node:n1", "security": "full", "ask": "off"}}"#,
        )
        .unwrap();
        let plane = plane_with(config);
        let mut r = req("uname");
        r.host = None;
        let out = plane.execute(r, |_| {}).await.unwrap();
        assert_eq!(out.exit_code, -1);
        assert!(out.output.contains("not connected"));
    }
}
