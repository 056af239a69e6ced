// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Connection registry — every live control-plane connection, indexed.
//!
//! ```text
//!           ┌───────────────┐   register/deregister   ┌──────────────┐
//!  ws conn ─┤ read loop     ├────────────────────────►│   registry   │
//!           │ write loop ◄──┼── bounded frame queue ──┤  (single     │
//!           └───────────────┘                         │   writer)    │
//!   operators / nodes / channel plugins               └──────────────┘
//! ```
//!
//! One device may hold two concurrent connections (operator + node). They
//! authorize independently and are deduplicated only in presence views,
//! which group by `device_id`.
//!
//! Events are delivered with `try_send` into each connection's bounded
//! queue: a slow consumer loses events (and can detect the gap through
//! `seq`), it never stalls the producer. Responses to a connection's own
//! requests go through the same queue from its own task, which awaits
//! capacity instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use porter_proto::{ErrorCode, Frame, Role, Scope, WireError};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque handle to one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Immutable facts about a connection, fixed at handshake.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnId,
    pub device_id: String,
    pub role: Role,
    pub scopes: Vec<Scope>,
    pub display_name: Option<String>,
    /// Channel served, for `channel-plugin` connections.
    pub channel: Option<String>,
}

impl ConnectionInfo {
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

struct ConnEntry {
    info: ConnectionInfo,
    tx: mpsc::Sender<Frame>,
    topics: std::collections::HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    conns: HashMap<ConnId, ConnEntry>,
}

/// Process-wide registry of live connections.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, WireError>>>>,
    request_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(RegistryState::default()),
            pending: Mutex::new(HashMap::new()),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; `tx` is its bounded outbound frame queue.
    pub async fn register(
        &self,
        device_id: String,
        role: Role,
        scopes: Vec<Scope>,
        display_name: Option<String>,
        channel: Option<String>,
        tx: mpsc::Sender<Frame>,
    ) -> ConnectionInfo {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = ConnectionInfo {
            id,
            device_id,
            role,
            scopes,
            display_name,
            channel,
        };
        self.state.lock().await.conns.insert(
            id,
            ConnEntry {
                info: info.clone(),
                tx,
                topics: Default::default(),
            },
        );
        debug!(%id, role = ?info.role, device = %info.device_id, "connection registered");
        self.broadcast_presence("connected", &info).await;
        info
    }

    pub async fn deregister(&self, id: ConnId) {
        let removed = self.state.lock().await.conns.remove(&id);
        if let Some(entry) = removed {
            debug!(%id, "connection deregistered");
            self.broadcast_presence("disconnected", &entry.info).await;
        }
    }

    async fn broadcast_presence(&self, action: &str, info: &ConnectionInfo) {
        let frame = Frame::event(
            porter_proto::methods::event::PRESENCE,
            json!({
                "action": action,
                "deviceId": info.device_id,
                "role": info.role,
                "displayName": info.display_name,
            }),
        );
        self.broadcast(|c| c.role == Role::Operator && c.has_scope(Scope::Read), frame)
            .await;
    }

    /// Deliver a frame to one connection. Events are dropped (with a log)
    /// when the queue is full — slow consumers detect loss via `seq`.
    pub async fn send_to(&self, id: ConnId, frame: Frame) -> bool {
        let state = self.state.lock().await;
        let Some(entry) = state.conns.get(&id) else {
            return false;
        };
        match entry.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%id, "outbound queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver a frame to every connection matching `predicate`.
    pub async fn broadcast<F>(&self, predicate: F, frame: Frame) -> usize
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        let state = self.state.lock().await;
        let mut delivered = 0;
        for entry in state.conns.values() {
            if predicate(&entry.info) && entry.tx.try_send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to every connection subscribed to `topic`.
    pub async fn send_topic(&self, topic: &str, frame: Frame) -> usize {
        let state = self.state.lock().await;
        let mut delivered = 0;
        for entry in state.conns.values() {
            if entry.topics.contains(topic) && entry.tx.try_send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver an event frame once per interested connection: topic
    /// subscribers plus everything matching `predicate`, deduplicated (a
    /// subscribed operator gets one copy, not two).
    pub async fn deliver_event<F>(&self, topic: &str, predicate: F, frame: Frame) -> usize
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        let state = self.state.lock().await;
        let mut delivered = 0;
        for entry in state.conns.values() {
            if (entry.topics.contains(topic) || predicate(&entry.info))
                && entry.tx.try_send(frame.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn subscribe(&self, id: ConnId, topic: String) {
        if let Some(entry) = self.state.lock().await.conns.get_mut(&id) {
            entry.topics.insert(topic);
        }
    }

    pub async fn unsubscribe(&self, id: ConnId, topic: &str) {
        if let Some(entry) = self.state.lock().await.conns.get_mut(&id) {
            entry.topics.remove(topic);
        }
    }

    pub async fn list_by_role(&self, role: Role) -> Vec<ConnectionInfo> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .conns
            .values()
            .filter(|e| e.info.role == role)
            .map(|e| e.info.clone())
            .collect();
        out.sort_by_key(|i| i.id);
        out
    }

    /// Presence view: connections grouped by device, so a device holding
    /// operator + node duals shows once with both roles.
    pub async fn devices(&self) -> Vec<(String, Vec<Role>)> {
        let state = self.state.lock().await;
        let mut grouped: HashMap<String, Vec<Role>> = HashMap::new();
        for entry in state.conns.values() {
            let roles = grouped.entry(entry.info.device_id.clone()).or_default();
            if !roles.contains(&entry.info.role) {
                roles.push(entry.info.role);
            }
        }
        let mut out: Vec<_> = grouped.into_iter().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    async fn find_node(&self, node_id: &str) -> Option<ConnId> {
        let state = self.state.lock().await;
        state
            .conns
            .values()
            .find(|e| e.info.role == Role::Node && e.info.device_id == node_id)
            .map(|e| e.info.id)
    }

    /// The live connection serving `channel`, when a plugin is attached.
    pub async fn channel_plugin(&self, channel: &str) -> Option<ConnId> {
        let state = self.state.lock().await;
        state
            .conns
            .values()
            .find(|e| {
                e.info.role == Role::ChannelPlugin
                    && e.info.channel.as_deref() == Some(channel)
            })
            .map(|e| e.info.id)
    }

    // ── Server-initiated requests (node invoke, plugin delivery) ──────────────

    /// Send a `req` frame to a connection and await its `res`.
    pub async fn request(
        &self,
        id: ConnId,
        method: &str,
        params: Value,
    ) -> Result<Value, WireError> {
        let req_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(req_id.clone(), tx);

        let frame = Frame::Req {
            id: req_id.clone(),
            method: method.to_string(),
            params,
        };
        // Clone the sender out of the lock: a full queue must block only
        // this request, never the registry.
        let tx = {
            let state = self.state.lock().await;
            state.conns.get(&id).map(|e| e.tx.clone())
        };
        let sent = match tx {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().await.remove(&req_id);
            return Err(WireError::new(ErrorCode::NotFound, "connection gone"));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WireError::new(ErrorCode::Internal, "request dropped")),
            Err(_) => {
                self.pending.lock().await.remove(&req_id);
                Err(WireError::new(ErrorCode::Timeout, "peer did not respond"))
            }
        }
    }

    /// Forward a command to a node by id (`node.invoke`, exec dispatch).
    pub async fn invoke_node(
        &self,
        node_id: &str,
        command: &str,
        args: Value,
    ) -> Result<Value, WireError> {
        let Some(conn) = self.find_node(node_id).await else {
            return Err(WireError::new(
                ErrorCode::NotFound,
                format!("node '{node_id}' is not connected"),
            ));
        };
        self.request(conn, "invoke", json!({"command": command, "args": args}))
            .await
    }

    /// Route a `res` frame from a peer back to the awaiting request.
    /// Returns false when no request with that id is pending.
    pub async fn complete_request(
        &self,
        res_id: &str,
        ok: bool,
        payload: Option<Value>,
        error: Option<WireError>,
    ) -> bool {
        let Some(tx) = self.pending.lock().await.remove(res_id) else {
            return false;
        };
        let result = if ok {
            Ok(payload.unwrap_or(Value::Null))
        } else {
            Err(error.unwrap_or_else(|| WireError::new(ErrorCode::Internal, "peer error")))
        };
        tx.send(result).is_ok()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn register(
        reg: &ConnectionRegistry,
        device: &str,
        role: Role,
        scopes: Vec<Scope>,
    ) -> (ConnectionInfo, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let info = reg
            .register(device.into(), role, scopes, None, None, tx)
            .await;
        (info, rx)
    }

    #[tokio::test]
    async fn register_assigns_unique_ids() {
        let reg = ConnectionRegistry::new();
        let (a, _rx_a) = register(&reg, "d1", Role::Operator, vec![Scope::Read]).await;
        let (b, _rx_b) = register(&reg, "d2", Role::Operator, vec![Scope::Read]).await;
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn send_to_delivers_frames() {
        let reg = ConnectionRegistry::new();
        let (info, mut rx) = register(&reg, "d1", Role::Operator, vec![Scope::Read]).await;
        assert!(reg.send_to(info.id, Frame::event("presence", json!({}))).await);
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::Event { .. }));
    }

    #[tokio::test]
    async fn broadcast_respects_predicate() {
        let reg = ConnectionRegistry::new();
        let (_op, mut op_rx) =
            register(&reg, "op", Role::Operator, vec![Scope::Read, Scope::Approvals]).await;
        let (_node, mut node_rx) = register(&reg, "n1", Role::Node, vec![]).await;

        let n = reg
            .broadcast(
                |c| c.has_scope(Scope::Approvals),
                Frame::event("approval.requested", json!({})),
            )
            .await;
        assert_eq!(n, 1);
        // The operator received it (past the presence frames from
        // registration time); the node saw nothing.
        let mut operator_saw = false;
        while let Ok(frame) = op_rx.try_recv() {
            if let Frame::Event { event, .. } = frame {
                if event == "approval.requested" {
                    operator_saw = true;
                }
            }
        }
        assert!(operator_saw);
        while let Ok(frame) = node_rx.try_recv() {
            if let Frame::Event { event, .. } = frame {
                assert_ne!(event, "approval.requested");
            }
        }
    }

    #[tokio::test]
    async fn topic_subscription_routes_frames() {
        let reg = ConnectionRegistry::new();
        let (info, mut rx) = register(&reg, "d1", Role::Operator, vec![Scope::Read]).await;
        reg.subscribe(info.id, "session:web:default:dm:u1".into()).await;

        let n = reg
            .send_topic("session:web:default:dm:u1", Frame::event("agent", json!({})))
            .await;
        assert_eq!(n, 1);
        // Drain until the agent event shows up.
        loop {
            match rx.try_recv() {
                Ok(Frame::Event { event, .. }) if event == "agent" => break,
                Ok(_) => continue,
                Err(_) => panic!("agent event not delivered"),
            }
        }

        reg.unsubscribe(info.id, "session:web:default:dm:u1").await;
        let n = reg
            .send_topic("session:web:default:dm:u1", Frame::event("agent", json!({})))
            .await;
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn devices_group_operator_and_node_duals() {
        let reg = ConnectionRegistry::new();
        let (_a, _rx_a) = register(&reg, "phone", Role::Operator, vec![Scope::Read]).await;
        let (_b, _rx_b) = register(&reg, "phone", Role::Node, vec![]).await;

        let devices = reg.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].0, "phone");
        assert_eq!(devices[0].1.len(), 2, "both roles under one device");
    }

    #[tokio::test]
    async fn invoke_node_round_trips_through_pending_map() {
        let reg = Arc::new(ConnectionRegistry::new());
        let (_info, mut node_rx) = register(&reg, "n1", Role::Node, vec![]).await;

        // Simulated node: answer the first req it sees.
        let reg2 = reg.clone();
        tokio::spawn(async move {
            while let Some(frame) = node_rx.recv().await {
                if let Frame::Req { id, method, .. } = frame {
                    assert_eq!(method, "invoke");
                    reg2.complete_request(&id, true, Some(json!({"code": 0})), None)
                        .await;
                    break;
                }
            }
        });

        let result = reg
            .invoke_node("n1", "system.run", json!({"command": "uname"}))
            .await
            .unwrap();
        assert_eq!(result["code"], 0);
    }

    #[tokio::test]
    async fn invoke_unknown_node_is_not_found() {
        let reg = ConnectionRegistry::new();
        let err = reg.invoke_node("ghost", "system.run", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn stale_response_id_is_ignored() {
        let reg = ConnectionRegistry::new();
        assert!(!reg.complete_request("never-issued", true, None, None).await);
    }

    #[tokio::test]
    async fn deregister_removes_connection() {
        let reg = ConnectionRegistry::new();
        let (info, _rx) = register(&reg, "d1", Role::Operator, vec![Scope::Read]).await;
        reg.deregister(info.id).await;
        assert!(!reg.send_to(info.id, Frame::event("x", json!({}))).await);
        assert!(reg.list_by_role(Role::Operator).await.is_empty());
    }

    #[tokio::test]
    async fn channel_plugin_lookup_by_channel_name() {
        let reg = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(16);
        reg.register(
            "tg-bridge".into(),
            Role::ChannelPlugin,
            vec![Scope::Read, Scope::Write],
            None,
            Some("telegram".into()),
            tx,
        )
        .await;
        assert!(reg.channel_plugin("telegram").await.is_some());
        assert!(reg.channel_plugin("slack").await.is_none());
    }
}
