// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be on unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Channel name → per-channel settings. Channels not listed here use
    /// the defaults (policy `pairing`, per-peer DM scope, no debounce).
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    /// Global DM scope; per-channel settings override it.
    #[serde(default)]
    pub dm_scope: DmScope,
    /// Explicitly linked peer groups. A resolver only folds two peers onto
    /// one session key when both appear in the same link group.
    #[serde(default)]
    pub identity_links: Vec<IdentityLink>,
    /// Agent name → agent settings. The empty map still yields a usable
    /// gateway: sessions run the built-in `default` agent.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
}

impl Config {
    /// Effective DM scope for a channel (per-channel beats global).
    pub fn dm_scope_for(&self, channel: &str) -> DmScope {
        self.channels
            .get(channel)
            .and_then(|c| c.dm_scope)
            .unwrap_or(self.dm_scope)
    }

    /// Effective per-channel settings, falling back to defaults.
    pub fn channel(&self, channel: &str) -> ChannelConfig {
        self.channels.get(channel).cloned().unwrap_or_default()
    }

    /// The agent a session runs when none is pinned. Falls back to a
    /// built-in default when the config names no agents.
    pub fn agent(&self, name: &str) -> AgentConfig {
        self.agents.get(name).cloned().unwrap_or_default()
    }
}

// ── Gateway / transport ───────────────────────────────────────────────────────

/// Where the control-plane listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindMode {
    /// 127.0.0.1 only. No shared secret required.
    #[default]
    Loopback,
    /// A LAN interface. Requires a token or password.
    Lan,
    /// Behind an identity-injecting tunnel. TLS and identity are the
    /// tunnel's job; the gateway trusts the configured header.
    Tunnel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub mode: BindMode,
    /// Listen address, e.g. `127.0.0.1:7450`.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared password alternative to the stored token. Either satisfies
    /// a non-loopback handshake.
    #[serde(default)]
    pub password: Option<String>,
    /// Accept the tunnel's identity header in lieu of a token.
    #[serde(default)]
    pub trust_tunnel_identity: bool,
    /// Header the fronting tunnel injects, e.g. `x-forwarded-user`.
    #[serde(default = "default_identity_header")]
    pub tunnel_identity_header: String,
    /// Seconds between server pings; two missed pongs drop the connection.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Outbound frame queue depth per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_bind() -> String {
    "127.0.0.1:7450".to_string()
}
fn default_identity_header() -> String {
    "x-forwarded-user".to_string()
}
fn default_heartbeat() -> u64 {
    30
}
fn default_outbound_queue() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: BindMode::Loopback,
            bind: default_bind(),
            password: None,
            trust_tunnel_identity: false,
            tunnel_identity_header: default_identity_header(),
            heartbeat_secs: default_heartbeat(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

// ── Channels ──────────────────────────────────────────────────────────────────

/// First-contact gate for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairingPolicy {
    /// Unknown senders receive a pairing code; operators approve them.
    #[default]
    Pairing,
    /// Only allowlisted senders are admitted.
    Allowlist,
    /// Everyone is admitted iff the allowlist contains `"*"`.
    Open,
    /// All inbound dropped.
    Disabled,
}

/// Whether all DMs on an account share one session or get one per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    #[default]
    Peer,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(default)]
    pub policy: PairingPolicy,
    /// Overrides the global DM scope when set.
    #[serde(default)]
    pub dm_scope: Option<DmScope>,
    /// Inbound coalescing window in milliseconds. 0 = deliver immediately.
    #[serde(default)]
    pub debounce_ms: u64,
    /// Hard per-message character limit of the transport.
    #[serde(default = "default_text_limit")]
    pub text_limit: usize,
    /// Whether the transport renders markdown. When false, outbound
    /// markdown is flattened to plain text.
    #[serde(default = "default_true")]
    pub markdown: bool,
}

fn default_text_limit() -> usize {
    4000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            policy: PairingPolicy::default(),
            dm_scope: None,
            debounce_ms: 0,
            text_limit: default_text_limit(),
            markdown: true,
        }
    }
}

/// One endpoint of an identity link: `channel:peerId`.
///
/// Linked groups fold the listed peers onto a single session key. Peers
/// outside an explicit group are never folded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub members: Vec<String>,
}

// ── Agents ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Tool-name globs the agent may call. `["*"]` = everything.
    #[serde(default = "default_tool_allow")]
    pub tools_allow: Vec<String>,
    /// Tool-name globs denied even when allowed above. Deny wins.
    #[serde(default)]
    pub tools_deny: Vec<String>,
    /// Sub-agent spawning is a separate policy family from ordinary tools.
    #[serde(default)]
    pub subagents_allow: Vec<String>,
    /// Per-agent exec overrides; unset fields fall through to `exec`.
    #[serde(default)]
    pub exec: ExecOverrides,
    /// Transcript-head turns replayed into each new turn's prompt.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
}

fn default_system_prompt() -> String {
    "You are a helpful assistant reachable over chat.".to_string()
}
fn default_tool_allow() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_context_turns() -> usize {
    20
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            tools_allow: default_tool_allow(),
            tools_deny: Vec::new(),
            subagents_allow: Vec::new(),
            exec: ExecOverrides::default(),
            context_turns: default_context_turns(),
        }
    }
}

// ── Exec plane ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityMode {
    Deny,
    #[default]
    Allowlist,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AskMode {
    Off,
    #[default]
    OnMiss,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    /// Default exec host: `sandbox`, `gateway`, or `node:<id>`.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub security: SecurityMode,
    #[serde(default)]
    pub ask: AskMode,
    /// Seconds before a pending approval times out (treated as deny).
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
    /// Combined stdout+stderr hard cap in bytes.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
    /// Trailing bytes retained when the cap overflows.
    #[serde(default = "default_output_tail")]
    pub output_tail_bytes: usize,
}

fn default_host() -> String {
    "sandbox".to_string()
}
fn default_approval_timeout() -> u64 {
    60
}
fn default_output_cap() -> usize {
    200 * 1024
}
fn default_output_tail() -> usize {
    20 * 1024
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            security: SecurityMode::default(),
            ask: AskMode::default(),
            approval_timeout_secs: default_approval_timeout(),
            output_cap_bytes: default_output_cap(),
            output_tail_bytes: default_output_tail(),
        }
    }
}

/// Per-agent exec overrides; `None` falls through to the global config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOverrides {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub security: Option<SecurityMode>,
    #[serde(default)]
    pub ask: Option<AskMode>,
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Per-session turn queue bound; overflow merges into the last entry.
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,
    /// Idle seconds before a session is evicted (state flushed first).
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    /// System-event ring capacity per session.
    #[serde(default = "default_event_ring")]
    pub system_event_ring: usize,
}

fn default_queue_bound() -> usize {
    8
}
fn default_idle_ttl() -> u64 {
    3600
}
fn default_event_ring() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_bound: default_queue_bound(),
            idle_ttl_secs: default_idle_ttl(),
            system_event_ring: default_event_ring(),
        }
    }
}

// ── Pairing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingConfig {
    /// Seconds before a pending pairing request expires.
    #[serde(default = "default_pairing_ttl")]
    pub ttl_secs: u64,
    /// Per-channel cap on pending requests; the oldest is evicted at cap.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_pairing_ttl() -> u64 {
    3600
}
fn default_max_pending() -> usize {
    3
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_pairing_ttl(),
            max_pending: default_max_pending(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
