// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session state: the registry of minted sessions and the append-only
//! transcript log behind `chat.history`.
//!
//! Sessions are minted lazily on first inbound (or on first outbound to a
//! new target, so later inbound from that peer attaches to the same key).
//! They are never deleted — idle workers are evicted, but the transcript
//! and the registry entry survive so routing stays stable across restarts.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Context;
use chrono::Utc;
use porter_config::StateDir;
use porter_proto::HistoryEntry;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::session_key::SessionKey;

// ── Registry ──────────────────────────────────────────────────────────────────

/// Minimal per-session bookkeeping kept by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub key: SessionKey,
    /// Agent the session currently runs.
    pub agent: String,
    pub created_at_ms: i64,
    pub last_activity_ms: i64,
    /// Set when a session was minted by an outbound send rather than an
    /// inbound message, so the first inbound has context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_note: Option<String>,
}

/// Registry of all minted sessions, keyed by canonical session key.
///
/// Mutations run under one async mutex — minting is check-then-insert and
/// must be atomic so an inbound burst mints exactly one session.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<SessionKey, SessionMeta>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the session if it does not exist. Returns `(meta, created)`.
    pub async fn ensure(&self, key: &SessionKey, agent: &str) -> (SessionMeta, bool) {
        let mut map = self.inner.lock().await;
        let now = Utc::now().timestamp_millis();
        match map.get_mut(key) {
            Some(meta) => {
                meta.last_activity_ms = now;
                (meta.clone(), false)
            }
            None => {
                let meta = SessionMeta {
                    key: key.clone(),
                    agent: agent.to_string(),
                    created_at_ms: now,
                    last_activity_ms: now,
                    origin_note: None,
                };
                map.insert(key.clone(), meta.clone());
                (meta, true)
            }
        }
    }

    /// Mint a session for an outbound target, recording why it exists.
    pub async fn ensure_with_origin(
        &self,
        key: &SessionKey,
        agent: &str,
        origin_note: impl Into<String>,
    ) -> (SessionMeta, bool) {
        let (mut meta, created) = self.ensure(key, agent).await;
        if created {
            let note = origin_note.into();
            let mut map = self.inner.lock().await;
            if let Some(m) = map.get_mut(key) {
                m.origin_note = Some(note.clone());
                meta.origin_note = Some(note);
            }
        }
        (meta, created)
    }

    pub async fn get(&self, key: &SessionKey) -> Option<SessionMeta> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &SessionKey) -> bool {
        self.inner.lock().await.contains_key(key)
    }

    pub async fn list(&self) -> Vec<SessionMeta> {
        let mut all: Vec<_> = self.inner.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

// ── Transcript log ────────────────────────────────────────────────────────────

/// Append-only JSONL transcript, one file per `(agent, sessionKey)`.
pub struct TranscriptLog {
    state: StateDir,
}

impl TranscriptLog {
    pub fn new(state: StateDir) -> Self {
        Self { state }
    }

    /// Append one entry. Creates the agent directory on first write.
    pub fn append(
        &self,
        agent: &str,
        key: &SessionKey,
        role: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        let entry = HistoryEntry {
            role: role.to_string(),
            text: text.to_string(),
            at_ms: Utc::now().timestamp_millis(),
        };
        let path = self.state.session_log(agent, key.as_str());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let line = serde_json::to_string(&entry).context("serializing transcript entry")?;
        writeln!(file, "{line}").with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Read the last `limit` entries (all when `limit` is `None`).
    ///
    /// Unparseable lines are skipped: a torn write must not make the whole
    /// history unreadable.
    pub fn tail(
        &self,
        agent: &str,
        key: &SessionKey,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<HistoryEntry>> {
        let path = self.state.session_log(agent, key.as_str());
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut entries: Vec<HistoryEntry> = text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if let Some(n) = limit {
            let skip = entries.len().saturating_sub(n);
            entries.drain(..skip);
        }
        Ok(entries)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
