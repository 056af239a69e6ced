// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Porter runtime core: session routing, per-session turn scheduling, and
//! the agent run driver.
//!
//! ```text
//! inbound ──► KeyResolver ──► Scheduler ──► session worker ──► run_turn
//!                 │               │               │               │
//!                 ▼               ▼               ▼               ▼
//!           SessionKey      SessionStore     Debouncer      ModelProvider
//!                            + transcript    + queue        + ToolDispatcher
//! ```
//!
//! Everything here is transport-agnostic: the gateway crate wires these
//! pieces to the wire protocol, the channel adapters, and the exec plane.

pub mod debounce;
pub mod driver;
pub mod events;
pub mod glob;
pub mod scheduler;
pub mod session;
pub mod session_key;

pub use debounce::{Debouncer, FlushedInput, InboundMessage};
pub use driver::{
    run_turn, NoTools, ToolCallRequest, ToolCallResult, ToolDispatcher, ToolPolicy, TurnContext,
    TurnEmitter, TurnInput, TurnState,
};
pub use events::{LifecycleKind, SystemEventRing, TurnEvent, TurnNotice};
pub use glob::{any_match, compile_globs, glob_to_regex};
pub use scheduler::{CancelReason, Scheduler};
pub use session::{SessionMeta, SessionStore, TranscriptLog};
pub use session_key::{canonical_peer_id, KeyResolver, PeerAddress, SessionKey};
