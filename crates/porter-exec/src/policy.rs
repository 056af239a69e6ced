// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Exec policy resolution and authorization.
//!
//! Three layers, strict precedence: the tool-call parameters, then the
//! per-agent overrides, then the global exec config. The resolved triple
//! is `(host, security, ask)`. Authorization then reduces to one of three
//! outcomes: run it, ask an operator, or refuse.
//!
//! Allowlist matching happens on the *resolved binary path* — the first
//! shell word, resolved through `PATH` when it is a bare name — so a
//! pattern like `/usr/bin/uname` cannot be dodged with `./uname` tricks
//! and `git *` style name patterns still work for tools that are found on
//! the path.

use std::path::{Path, PathBuf};

use porter_config::{AgentConfig, AskMode, ExecConfig, SecurityMode};

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecHost {
    Sandbox,
    Gateway,
    Node(String),
}

impl ExecHost {
    /// Parse `"sandbox" | "gateway" | "node:<id>"`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sandbox" => Some(ExecHost::Sandbox),
            "gateway" => Some(ExecHost::Gateway),
            other => other.strip_prefix("node:").map(|id| {
                ExecHost::Node(id.to_string())
            }),
        }
    }
}

impl std::fmt::Display for ExecHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecHost::Sandbox => write!(f, "sandbox"),
            ExecHost::Gateway => write!(f, "gateway"),
            ExecHost::Node(id) => write!(f, "node:{id}"),
        }
    }
}

/// The effective `(host, security, ask)` for one exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub host: ExecHost,
    pub security: SecurityMode,
    pub ask: AskMode,
}

/// Resolve policy fields with tool-param > per-agent > global precedence.
///
/// An unparseable host override falls through to the next layer rather
/// than silently executing somewhere unexpected.
pub fn resolve_policy(
    param_host: Option<&str>,
    param_security: Option<SecurityMode>,
    param_ask: Option<AskMode>,
    agent: &AgentConfig,
    global: &ExecConfig,
) -> ResolvedPolicy {
    let host = param_host
        .and_then(ExecHost::parse)
        .or_else(|| agent.exec.host.as_deref().and_then(ExecHost::parse))
        .or_else(|| ExecHost::parse(&global.host))
        .unwrap_or(ExecHost::Sandbox);

    let security = param_security
        .or(agent.exec.security)
        .unwrap_or(global.security);

    let ask = param_ask.or(agent.exec.ask).unwrap_or(global.ask);

    ResolvedPolicy {
        host,
        security,
        ask,
    }
}

/// Outcome of the authorization check, before any approval round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Run without asking.
    Allowed,
    /// Post an approval request and wait.
    NeedsApproval { reason: String },
    /// Refuse outright (`EXEC_DENIED`).
    Denied { reason: String },
}

/// Apply the security/ask matrix to a command.
///
/// `allowlisted` is whether the resolved binary matched the effective
/// allowlist for the chosen host.
pub fn authorize(policy: &ResolvedPolicy, allowlisted: bool) -> Authorization {
    match policy.security {
        SecurityMode::Deny => Authorization::Denied {
            reason: "exec disabled by policy".into(),
        },
        SecurityMode::Full => match policy.ask {
            AskMode::Always => Authorization::NeedsApproval {
                reason: "policy asks for every command".into(),
            },
            _ => Authorization::Allowed,
        },
        SecurityMode::Allowlist => match (allowlisted, policy.ask) {
            (true, AskMode::Always) => Authorization::NeedsApproval {
                reason: "policy asks for every command".into(),
            },
            (true, _) => Authorization::Allowed,
            (false, AskMode::Off) => Authorization::Denied {
                reason: "command not in allowlist".into(),
            },
            (false, _) => Authorization::NeedsApproval {
                reason: "command not in allowlist".into(),
            },
        },
    }
}

// ── Binary resolution ─────────────────────────────────────────────────────────

/// Extract the first shell word of `command` and resolve it to a binary
/// path: absolute/relative paths pass through, bare names are searched on
/// `path_env` (falling back to the bare name when not found, so name
/// patterns still match).
pub fn resolve_binary(command: &str, path_env: Option<&str>) -> String {
    let first = match shell_first_word(command) {
        Some(w) => w,
        None => return String::new(),
    };
    if first.contains('/') {
        return first;
    }
    if let Some(paths) = path_env {
        for dir in paths.split(':').filter(|d| !d.is_empty()) {
            let candidate: PathBuf = Path::new(dir).join(&first);
            if candidate.is_file() {
                return candidate.to_string_lossy().into_owned();
            }
        }
    }
    first
}

/// First whitespace-delimited word, honoring simple quoting.
fn shell_first_word(command: &str) -> Option<String> {
    let trimmed = command.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let mut out = String::new();
    let mut quote: Option<char> = None;
    for ch in trimmed.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    out.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => break,
                c => out.push(c),
            },
        }
    }
    Some(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
