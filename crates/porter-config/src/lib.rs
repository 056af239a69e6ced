// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Configuration for the porter gateway.
//!
//! The whole configuration lives in one `config.json` at the root of the
//! state directory. It is loaded at boot (invalid config is a fatal error —
//! the process must exit before any socket binds) and can be hot-reloaded
//! at runtime; reload is non-destructive: live sessions keep the resolution
//! results they were minted with, only new sessions observe the new config.

pub mod loader;
pub mod schema;
pub mod state_dir;

pub use loader::{load, watch, ConfigError};
pub use schema::{
    AgentConfig, AskMode, BindMode, ChannelConfig, Config, DmScope, ExecConfig, ExecOverrides,
    GatewayConfig, IdentityLink, PairingConfig, PairingPolicy, SecurityMode, SessionConfig,
};
pub use state_dir::StateDir;
