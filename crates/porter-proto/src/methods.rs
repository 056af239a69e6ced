// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Typed params and results for every control-plane method, plus the event
//! payloads the gateway pushes.
//!
//! | method             | params                      | result                  |
//! |--------------------|-----------------------------|-------------------------|
//! | `chat.send`        | [`ChatSendParams`]          | [`ChatSendResult`]      |
//! | `chat.abort`       | [`ChatAbortParams`]         | `{ok}`                  |
//! | `chat.inject`      | [`ChatInjectParams`]        | `{ok}`                  |
//! | `chat.history`     | [`ChatHistoryParams`]       | [`ChatHistoryResult`]   |
//! | `node.invoke`      | [`NodeInvokeParams`]        | [`NodeInvokeResult`]    |
//! | `approval.list`    | `{}`                        | [`ApprovalListResult`]  |
//! | `approval.resolve` | [`ApprovalResolveParams`]   | `{ok}`                  |
//! | `pairing.list`     | [`PairingListParams`]       | [`PairingListResult`]   |
//! | `pairing.approve`  | [`PairingActParams`]        | `{ok}`                  |
//! | `pairing.deny`     | [`PairingActParams`]        | `{ok}`                  |

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Event names ───────────────────────────────────────────────────────────────

/// Event names the gateway publishes. Unknown names are dropped by clients.
pub mod event {
    pub const AGENT: &str = "agent";
    pub const PRESENCE: &str = "presence";
    pub const APPROVAL_REQUESTED: &str = "approval.requested";
    pub const PAIRING_CHANGED: &str = "pairing.changed";
    pub const VOICEWAKE_CHANGED: &str = "voicewake.changed";
    pub const EXEC_STARTED: &str = "exec.started";
    pub const EXEC_FINISHED: &str = "exec.finished";
    pub const EXEC_DENIED: &str = "exec.denied";
}

// ── Targets & peers ───────────────────────────────────────────────────────────

/// What kind of peer a message addresses. Becomes the `peerKind` tag in the
/// session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerKind {
    Dm,
    Group,
    Channel,
    /// Voice calls fold into the general key scheme under this tag.
    Voice,
}

impl PeerKind {
    /// The lowercase tag used inside session keys.
    pub fn tag(&self) -> &'static str {
        match self {
            PeerKind::Dm => "dm",
            PeerKind::Group => "group",
            PeerKind::Channel => "channel",
            PeerKind::Voice => "voice",
        }
    }
}

/// A transport-level peer reference, pre-canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub kind: PeerKind,
    pub id: String,
}

/// Fully qualified destination: which channel, which account on it, which
/// peer. The outbound router treats this as authoritative — the agent cannot
/// pick a different channel than its caller named.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub channel: String,
    pub account: String,
    pub peer: PeerRef,
    /// Thread / topic id, when the transport has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

// ── chat.* ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    /// Address an existing session directly…
    #[serde(default)]
    pub session_key: Option<String>,
    /// …or derive the session from a target peer (the normal path).
    #[serde(default)]
    pub target: Option<Target>,
    pub message: String,
    /// Retries with the same key within the retry window return the
    /// original run id instead of starting a second run.
    pub idempotency_key: String,
    #[serde(default)]
    pub repo_context: Option<String>,
    /// Advisory only; recorded on the turn and echoed in lifecycle events.
    #[serde(default)]
    pub thinking: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendResult {
    pub run_id: String,
    /// Always `"started"`; events stream separately over `event: agent`.
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAbortParams {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInjectParams {
    pub session_key: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryParams {
    pub session_key: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One transcript entry as persisted in the session's JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub role: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistoryResult {
    pub entries: Vec<HistoryEntry>,
}

// ── node.invoke ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInvokeParams {
    pub node_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInvokeResult {
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
}

// ── approval.* ────────────────────────────────────────────────────────────────

/// Operator decision on a pending exec approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    AllowOnce,
    /// Allow and append a matching allowlist entry for the host.
    AllowAndAdd,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResolveParams {
    pub approval_id: String,
    pub decision: ApprovalDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalEntry {
    pub approval_id: String,
    pub session_key: String,
    pub command: String,
    pub host: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub requested_at_ms: i64,
    pub ttl_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalListResult {
    pub entries: Vec<ApprovalEntry>,
}

// ── pairing.* ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingListParams {
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingEntry {
    pub channel: String,
    pub sender: String,
    pub code: String,
    pub created_at_ms: i64,
    pub ttl_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingListResult {
    pub entries: Vec<PairingEntry>,
}

/// Params shared by `pairing.approve` and `pairing.deny`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingActParams {
    pub channel: String,
    pub sender: String,
}

// ── event: agent ──────────────────────────────────────────────────────────────

/// Which sub-stream of a run an `agent` event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    Assistant,
    Tool,
    Lifecycle,
}

/// Payload of an `event: agent` frame. `seq` is strictly increasing per run
/// with no gaps; subscribers rely on that to detect loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEventPayload {
    pub run_id: String,
    pub session_key: String,
    pub stream: StreamKind,
    pub seq: u64,
    pub data: Value,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_send_params_minimal() {
        let p: ChatSendParams = serde_json::from_value(json!({
            "target": {
                "channel": "web",
                "account": "default",
                "peer": {"kind": "dm", "id": "u1"}
            },
            "message": "hello",
            "idempotencyKey": "k1"
        }))
        .unwrap();
        assert_eq!(p.message, "hello");
        assert_eq!(p.target.as_ref().unwrap().peer.kind, PeerKind::Dm);
        assert!(p.session_key.is_none());
        assert!(p.thinking.is_none());
    }

    #[test]
    fn peer_kind_tags_are_lowercase() {
        assert_eq!(PeerKind::Dm.tag(), "dm");
        assert_eq!(PeerKind::Voice.tag(), "voice");
    }

    #[test]
    fn approval_decision_kebab_case() {
        let s = serde_json::to_string(&ApprovalDecision::AllowAndAdd).unwrap();
        assert_eq!(s, "\"allow-and-add\"");
        let back: ApprovalDecision = serde_json::from_str("\"allow-once\"").unwrap();
        assert_eq!(back, ApprovalDecision::AllowOnce);
    }

    #[test]
    fn agent_event_payload_round_trip() {
        let p = AgentEventPayload {
            run_id: "r1".into(),
            session_key: "web:default:dm:u1".into(),
            stream: StreamKind::Lifecycle,
            seq: 4,
            data: json!({"kind": "done"}),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["stream"], "lifecycle");
        assert_eq!(v["seq"], 4);
        let back: AgentEventPayload = serde_json::from_value(v).unwrap();
        assert_eq!(back.seq, 4);
    }

    #[test]
    fn history_entry_uses_camel_case_wire_names() {
        let e = HistoryEntry {
            role: "user".into(),
            text: "hi".into(),
            at_ms: 1000,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert!(v.get("atMs").is_some());
    }
}
