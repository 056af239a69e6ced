// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Gateway assembly — builds every subsystem and wires the pumps.
//!
//! # Startup sequence
//!
//! [`Gateway::build`] performs these steps in order; [`Gateway::run`]
//! then blocks on the listener:
//!
//! 1. Validate the bind mode (fail-closed: a LAN/tunnel bind with no
//!    shared secret is a configuration error, before any socket opens).
//! 2. Load the control-plane secret; on a loopback first boot, mint one
//!    and say the raw value exactly once.
//! 3. Construct stores (sessions, transcripts, pairing, exec allowlists,
//!    voicewake, audit) on the state directory.
//! 4. Build the scheduler, channel registry (built-in web chat), exec
//!    plane (node invoker attached), outbound router, and tool surface.
//! 5. Spawn the event pumps: turn notices → wire + transports, exec
//!    events → wire + system-event rings, config watcher → hot reload.
//! 6. Bind the listener and serve until Ctrl+C / `gateway.stop`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use porter_channels::{ChannelRegistry, OutboundPayload, WebChatAdapter};
use porter_config::{BindMode, Config, StateDir};
use porter_core::{
    KeyResolver, Scheduler, SessionKey, SessionStore, TranscriptLog, TurnEvent, TurnNotice,
};
use porter_exec::{ExecEvent, ExecPlane, ExecStore, NodeInvoker};
use porter_model::ModelProvider;
use porter_proto::{
    methods::event, AgentEventPayload, Frame, PeerKind, PeerRef, Role, Scope, Target,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::auth::AuthState;
use crate::connection::ConnectionDeps;
use crate::dispatch::Dispatcher;
use crate::outbound::OutboundRouter;
use crate::pairing::PairingStore;
use crate::registry::ConnectionRegistry;
use crate::secret::{self, SecretRecord};
use crate::tools::GatewayTools;
use crate::voicewake::VoicewakeStore;

/// Configuration problems that must stop the process before it accepts
/// connections (CLI exit code 2).
#[derive(Debug, Error)]
pub enum BootError {
    #[error("invalid bind address '{0}': {1}")]
    BadBind(String, String),

    #[error("loopback mode requires a loopback bind address, got {0}")]
    NotLoopback(SocketAddr),

    #[error("{0:?} mode requires a minted secret, a password, or trusted tunnel identity")]
    NoSecret(BindMode),

    #[error("state error: {0}")]
    State(#[from] anyhow::Error),
}

/// A fully assembled gateway, ready to serve.
pub struct Gateway {
    bind: SocketAddr,
    deps: Arc<ConnectionDeps>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Assemble all subsystems. `provider` is the model capability the
    /// agent driver runs against (collaborator HTTP adapters implement
    /// the same trait; the built-in default is the echo mock).
    pub fn build(
        state: StateDir,
        config: Config,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<Gateway, BootError> {
        let bind: SocketAddr = config
            .gateway
            .bind
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                BootError::BadBind(config.gateway.bind.clone(), e.to_string())
            })?;

        if config.gateway.mode == BindMode::Loopback && !bind.ip().is_loopback() {
            return Err(BootError::NotLoopback(bind));
        }

        // ── Control-plane secret ──────────────────────────────────────────────
        // Load the salted record; a corrupt one is fatal (fail-closed). On
        // a loopback first boot there is nothing yet — mint one so remote
        // clients can be paired later, and say the raw value exactly once.
        let secret_path = state.secret_file();
        let mut secret = SecretRecord::load(&secret_path)?;
        if secret.is_none() && config.gateway.mode == BindMode::Loopback {
            let (issued, record) = secret::rotate(&secret_path)?;
            info!(path = %secret_path.display(), "first boot, minted the control-plane secret");
            info!("remote clients pair with this secret; it will not be printed again:");
            info!("    {}", issued.expose());
            info!("lose it and `porter gateway regenerate-token` mints a replacement");
            secret = Some(record);
        }

        // Fail-closed: a reachable bind with no credential configured is a
        // misconfiguration, caught before any socket opens.
        if let mode @ (BindMode::Lan | BindMode::Tunnel) = config.gateway.mode {
            let has_credential = secret.is_some()
                || config.gateway.password.is_some()
                || (mode == BindMode::Tunnel && config.gateway.trust_tunnel_identity);
            if !has_credential {
                return Err(BootError::NoSecret(mode));
            }
        }

        let config = Arc::new(config);

        // ── Stores ────────────────────────────────────────────────────────────
        let audit = Arc::new(AuditLog::new(state.audit_file()));
        let store = Arc::new(SessionStore::new());
        let transcript = Arc::new(TranscriptLog::new(state.clone()));
        let pairing = Arc::new(PairingStore::new(state.clone(), config.clone(), audit.clone()));
        let exec_store = ExecStore::load(&state.exec_approvals_file())?;
        let voicewake = Arc::new(VoicewakeStore::load(state.voicewake_file())?);

        // ── Core subsystems ───────────────────────────────────────────────────
        let registry = Arc::new(ConnectionRegistry::new());
        let channels = ChannelRegistry::new();
        let webchat = Arc::new(WebChatAdapter::new());
        channels.register(webchat);

        let scheduler = Scheduler::new(
            config.clone(),
            provider,
            transcript.clone(),
            store.clone(),
        );

        let plane = Arc::new(ExecPlane::new(config.clone(), exec_store));
        plane.set_node_invoker(Arc::new(RegistryNodeInvoker {
            registry: registry.clone(),
        }));

        let router = Arc::new(OutboundRouter::new(
            config.clone(),
            channels.clone(),
            store.clone(),
        ));

        scheduler.set_tools(Arc::new(GatewayTools::new(
            plane.clone(),
            router.clone(),
            store.clone(),
        )));

        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher {
            config: std::sync::RwLock::new(config.clone()),
            resolver: std::sync::RwLock::new(Arc::new(KeyResolver::from_config(&config))),
            scheduler: scheduler.clone(),
            registry: registry.clone(),
            pairing: pairing.clone(),
            plane: plane.clone(),
            router: router.clone(),
            voicewake,
            audit,
            started_at: Instant::now(),
            shutdown: shutdown.clone(),
        });

        // ── Event pumps ───────────────────────────────────────────────────────
        tokio::spawn(notice_pump(
            scheduler.clone(),
            registry.clone(),
            router.clone(),
        ));
        tokio::spawn(exec_pump(
            plane.clone(),
            registry.clone(),
            scheduler.clone(),
        ));
        tokio::spawn(config_watch_pump(state.clone(), config.clone(), dispatcher.clone()));

        let deps = Arc::new(ConnectionDeps {
            auth: AuthState::new(&config.gateway, secret),
            dispatcher,
            registry,
            channels,
            tunnel_identity_header: config.gateway.tunnel_identity_header.clone(),
            outbound_queue: config.gateway.outbound_queue,
            heartbeat: Duration::from_secs(config.gateway.heartbeat_secs.max(1)),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        Ok(Gateway {
            bind,
            deps,
            shutdown,
        })
    }

    /// The dispatcher, for in-process clients and tests.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.deps.dispatcher.clone()
    }

    /// The channel-adapter registry (collaborators register adapters at
    /// boot; tests attach recording adapters).
    pub fn channels(&self) -> ChannelRegistry {
        self.deps.channels.clone()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until Ctrl+C, SIGTERM, or `gateway.stop`.
    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
        crate::server::serve(self.bind, self.deps, self.shutdown).await
    }
}

// ── Node invoker ──────────────────────────────────────────────────────────────

struct RegistryNodeInvoker {
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl NodeInvoker for RegistryNodeInvoker {
    async fn invoke(&self, node_id: &str, command: &str, args: Value) -> anyhow::Result<Value> {
        self.registry
            .invoke_node(node_id, command, args)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
    }
}

// ── Pumps ─────────────────────────────────────────────────────────────────────

/// Parse a canonical session key back into the target it addresses, for
/// mirroring agent output to the originating transport.
fn key_to_target(key: &SessionKey) -> Option<Target> {
    let parts: Vec<&str> = key.as_str().split(':').collect();
    if parts.len() < 4 {
        return None;
    }
    let kind = match parts[2] {
        "dm" => PeerKind::Dm,
        "group" => PeerKind::Group,
        "channel" => PeerKind::Channel,
        "voice" => PeerKind::Voice,
        _ => return None,
    };
    // Thread suffix: channel:account:kind:peer:thread:<topic>.
    let (peer_id, thread) = match parts.as_slice() {
        [_, _, _, peer, "thread", topic] => (peer.to_string(), Some(topic.to_string())),
        _ => (parts[3..].join(":"), None),
    };
    Some(Target {
        channel: parts[0].to_string(),
        account: parts[1].to_string(),
        peer: PeerRef { kind, id: peer_id },
        thread,
    })
}

/// Fan sequenced turn events to the wire and mirror assistant messages to
/// the session's own transport.
async fn notice_pump(
    scheduler: Scheduler,
    registry: Arc<ConnectionRegistry>,
    router: Arc<OutboundRouter>,
) {
    let mut rx = scheduler.subscribe();
    loop {
        let notice: TurnNotice = match rx.recv().await {
            Ok(n) => n,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("notice pump lagged by {n} events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        let payload = AgentEventPayload {
            run_id: notice.run_id.clone(),
            session_key: notice.session_key.to_string(),
            stream: notice.event.stream_kind(),
            seq: notice.seq,
            data: serde_json::to_value(&notice.event).unwrap_or(Value::Null),
        };
        let frame = Frame::seq_event(
            event::AGENT,
            serde_json::to_value(&payload).unwrap_or(Value::Null),
            notice.seq,
        );
        let topic = format!("session:{}", notice.session_key);
        registry
            .deliver_event(
                &topic,
                |c| c.role == Role::Operator && c.has_scope(Scope::Read),
                frame,
            )
            .await;

        // Mirror complete assistant messages back onto the transport the
        // session lives on.
        if let TurnEvent::AssistantMessage { text } = &notice.event {
            let Some(target) = key_to_target(&notice.session_key) else {
                continue;
            };
            let (key, result) = router
                .deliver(
                    &target,
                    OutboundPayload::text(text.clone()),
                    Some(&notice.session_key),
                )
                .await;
            if let Err(e) = result {
                debug!(%key, "transport mirror failed: {e}");
                scheduler.push_system_event(&key, format!("delivery failed: {e}"));
            }
        }
    }
}

/// Fan exec-plane events to the wire and into session system-event rings.
async fn exec_pump(
    plane: Arc<ExecPlane>,
    registry: Arc<ConnectionRegistry>,
    scheduler: Scheduler,
) {
    let mut rx = plane.subscribe();
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("exec pump lagged by {n} events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        match ev {
            ExecEvent::ApprovalRequested { entry } => {
                let frame = Frame::event(
                    event::APPROVAL_REQUESTED,
                    serde_json::to_value(&entry).unwrap_or(Value::Null),
                );
                registry
                    .broadcast(
                        |c| c.role == Role::Operator && c.has_scope(Scope::Approvals),
                        frame,
                    )
                    .await;
            }
            ExecEvent::Started {
                session_key,
                command,
                ..
            } => {
                let key = SessionKey::from_raw(&session_key);
                scheduler.push_system_event(&key, format!("exec started: {command}"));
                registry
                    .broadcast(
                        |c| c.role == Role::Operator && c.has_scope(Scope::Read),
                        Frame::event(
                            event::EXEC_STARTED,
                            json!({"sessionKey": session_key, "command": command}),
                        ),
                    )
                    .await;
            }
            ExecEvent::Finished {
                session_key, code, ..
            } => {
                let key = SessionKey::from_raw(&session_key);
                scheduler.push_system_event(&key, format!("exec finished (exit {code})"));
                registry
                    .broadcast(
                        |c| c.role == Role::Operator && c.has_scope(Scope::Read),
                        Frame::event(
                            event::EXEC_FINISHED,
                            json!({"sessionKey": session_key, "code": code}),
                        ),
                    )
                    .await;
            }
            ExecEvent::Denied {
                session_key,
                reason,
                ..
            } => {
                let key = SessionKey::from_raw(&session_key);
                scheduler.push_system_event(&key, format!("exec denied: {reason}"));
                registry
                    .broadcast(
                        |c| c.role == Role::Operator && c.has_scope(Scope::Read),
                        Frame::event(
                            event::EXEC_DENIED,
                            json!({"sessionKey": session_key, "reason": reason}),
                        ),
                    )
                    .await;
            }
        }
    }
}

/// Watch `config.json` and hot-reload derived state.
async fn config_watch_pump(state: StateDir, initial: Arc<Config>, dispatcher: Arc<Dispatcher>) {
    let mut rx = porter_config::watch(&state, (*initial).clone());
    while rx.changed().await.is_ok() {
        let config = rx.borrow().clone();
        info!("applying reloaded config");
        dispatcher.update_config(config);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
