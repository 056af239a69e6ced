// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between control-plane clients and the porter gateway.
//!
//! All types derive `Serialize`/`Deserialize` and travel as JSON text frames
//! over a persistent WebSocket connection. Three frame kinds exist on the
//! wire — `req`, `res`, `event` — plus the handshake, which is an ordinary
//! `req` with method `connect` that must be the first frame on a connection.
//!
//! # Typical connection flow
//!
//! ```text
//! Client                                Gateway
//!    │                                     │
//!    │── req {connect, minP, maxP, auth} ─►│  version window + auth checked
//!    │◄─ res {hello-ok, protocol: 3} ──────│
//!    │                                     │
//!    │── req {chat.send, target, msg} ────►│
//!    │◄─ res {runId, status: started} ─────│
//!    │◄─ event {agent, seq: 1, delta} ─────│
//!    │◄─ event {agent, seq: 2, delta} ─────│
//!    │◄─ event {agent, seq: N, done} ──────│
//! ```
//!
//! The codec never interprets request payloads; those are deserialized by
//! the dispatcher against the typed structs in [`methods`].

pub mod frame;
pub mod handshake;
pub mod methods;

pub use frame::{ErrorCode, Frame, WireError, MAX_FRAME_BYTES};
pub use handshake::{
    default_scopes, negotiate, ClientInfo, ConnectAuth, ConnectParams, Features, HelloOk, Role,
    Scope, ServerInfo, PROTOCOL_VERSION,
};
pub use methods::{
    AgentEventPayload, ApprovalDecision, ApprovalEntry, ApprovalListResult, ApprovalResolveParams,
    ChatAbortParams, ChatHistoryParams, ChatHistoryResult, ChatInjectParams, ChatSendParams,
    ChatSendResult, HistoryEntry, NodeInvokeParams, NodeInvokeResult, PairingActParams,
    PairingEntry, PairingListParams, PairingListResult, PeerKind, PeerRef, StreamKind, Target,
};
