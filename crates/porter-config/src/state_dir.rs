// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! State directory layout.
//!
//! ```text
//! <stateDir>/
//!   config.json                    loaded at boot, hot-reloadable
//!   secret.json                    salted digest of the control-plane secret
//!   audit.jsonl                    append-only audit trail
//!   pairing/<channel>.json         pending pairing requests + allowlist
//!   sessions/<agent>/<key>.jsonl   append-only session transcripts
//!   exec-approvals.json            exec defaults + per-agent allowlists
//!   voicewake.json                 wake trigger phrases
//! ```
//!
//! Session keys are lowercased before use as filenames; `/` in peer ids is
//! percent-encoded so keys never escape the sessions directory.

use std::path::{Path, PathBuf};

/// Resolved state directory with typed accessors for every file porter
/// persists. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform default: `~/.config/porter`.
    pub fn default_root() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config/porter");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn secret_file(&self) -> PathBuf {
        self.root.join("secret.json")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }

    pub fn pairing_file(&self, channel: &str) -> PathBuf {
        self.root
            .join("pairing")
            .join(format!("{}.json", sanitize_component(channel)))
    }

    pub fn session_log(&self, agent: &str, session_key: &str) -> PathBuf {
        self.root
            .join("sessions")
            .join(sanitize_component(agent))
            .join(format!("{}.jsonl", sanitize_component(session_key)))
    }

    pub fn exec_approvals_file(&self) -> PathBuf {
        self.root.join("exec-approvals.json")
    }

    pub fn voicewake_file(&self) -> PathBuf {
        self.root.join("voicewake.json")
    }
}

/// Lowercase and percent-encode path separators so a session key or channel
/// name always maps to exactly one file inside its directory.
fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars().flat_map(char::to_lowercase) {
        match ch {
            '/' => out.push_str("%2f"),
            '\\' => out.push_str("%5c"),
            c => out.push(c),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
