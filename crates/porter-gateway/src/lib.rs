// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Porter gateway — the control-plane server.
//!
//! ```text
//!                 ┌────────────────────────────────────────────┐
//!  operator ws ──►│ connection ─► dispatcher ─► scheduler ─► … │
//!  node ws ──────►│     │             │                        │
//!  plugin ws ────►│  registry      pairing / exec / outbound   │
//!                 └────────────────────────────────────────────┘
//! ```
//!
//! This crate binds everything together: auth and handshake, the live
//! connection registry, the pairing gate, wire-method dispatch, the exec
//! approval fan-out, and transport mirroring. The runtime semantics live
//! in `porter-core`; this crate is the part that faces sockets.

pub mod audit;
pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod gateway;
pub mod outbound;
pub mod pairing;
pub mod registry;
pub mod secret;
pub mod server;
pub mod tools;
pub mod voicewake;

pub use audit::AuditLog;
pub use auth::{AuthState, AuthVia, Principal};
pub use dispatch::Dispatcher;
pub use gateway::{BootError, Gateway};
pub use outbound::{OutboundRouter, PluginChannelAdapter};
pub use pairing::{GateDecision, PairingStore};
pub use registry::{ConnId, ConnectionInfo, ConnectionRegistry};
pub use secret::{IssuedSecret, SecretRecord};
pub use voicewake::{VoicewakeFile, VoicewakeStore};
