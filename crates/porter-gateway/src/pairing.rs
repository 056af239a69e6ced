// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Pairing & access store — first-contact authorization for gated
//! channels.
//!
//! Per-channel policy is one of `pairing | allowlist | open | disabled`.
//! Under `pairing`, an unknown sender gets a short code delivered back on
//! their own channel; an operator approves or denies it over the control
//! plane. Approval promotes the sender to the channel's allowlist.
//!
//! Every check-then-insert runs inside one critical section, so the
//! pending cap holds even under concurrent inbound bursts, and every
//! mutation persists to `pairing/<channel>.json` before returning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use chrono::Utc;
use porter_config::{Config, PairingPolicy};
use porter_config::StateDir;
use porter_proto::PairingEntry;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditLog;

/// What the gate decided for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Sender is authorized; route the message.
    Admit,
    /// A new pairing request was minted; send `code` back to the sender
    /// on their own channel and drop the message.
    PairingCreated { code: String },
    /// A request is already pending (its timestamp was refreshed); drop
    /// the message silently.
    PairingPending,
    /// Channel disabled, allowlist miss, or open channel without the
    /// wildcard entry: drop.
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingRequest {
    sender: String,
    code: String,
    created_at_ms: i64,
    ttl_ms: i64,
}

/// On-disk shape of `pairing/<channel>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChannelFile {
    #[serde(default)]
    pending: Vec<PendingRequest>,
    #[serde(default)]
    allow: Vec<String>,
}

pub struct PairingStore {
    state: StateDir,
    config: RwLock<Arc<Config>>,
    channels: Mutex<HashMap<String, ChannelFile>>,
    audit: Arc<AuditLog>,
}

impl PairingStore {
    pub fn new(state: StateDir, config: Arc<Config>, audit: Arc<AuditLog>) -> Self {
        Self {
            state,
            config: RwLock::new(config),
            channels: Mutex::new(HashMap::new()),
            audit,
        }
    }

    pub fn update_config(&self, config: Arc<Config>) {
        *self.config.write().unwrap() = config;
    }

    /// Gate one inbound message from `sender` on `channel`.
    pub fn gate(&self, channel: &str, sender: &str) -> GateDecision {
        let channel = channel.to_lowercase();
        let config = self.config.read().unwrap().clone();
        let policy = config.channel(&channel).policy;

        let mut channels = self.channels.lock().unwrap();
        let file = self.load_channel_locked(&mut channels, &channel);

        match policy {
            PairingPolicy::Disabled => GateDecision::Drop,
            PairingPolicy::Open => {
                if file.allow.iter().any(|a| a == "*") {
                    GateDecision::Admit
                } else {
                    GateDecision::Drop
                }
            }
            PairingPolicy::Allowlist => {
                if is_allowed(file, sender) {
                    GateDecision::Admit
                } else {
                    GateDecision::Drop
                }
            }
            PairingPolicy::Pairing => {
                if is_allowed(file, sender) {
                    return GateDecision::Admit;
                }
                let now = Utc::now().timestamp_millis();
                let ttl_ms = (config.pairing.ttl_secs as i64) * 1000;
                purge_expired(file, now);

                if let Some(existing) = file.pending.iter_mut().find(|p| p.sender == sender) {
                    // Refresh instead of duplicating.
                    existing.created_at_ms = now;
                    let _ = self.persist_channel(&channel, file);
                    return GateDecision::PairingPending;
                }

                // Cap check-and-insert is atomic: evict the oldest first.
                while file.pending.len() >= config.pairing.max_pending.max(1) {
                    let evicted = file.pending.remove(0);
                    info!(channel, sender = %evicted.sender, "pending pairing evicted (cap)");
                }
                let code = generate_code();
                file.pending.push(PendingRequest {
                    sender: sender.to_string(),
                    code: code.clone(),
                    created_at_ms: now,
                    ttl_ms,
                });
                let _ = self.persist_channel(&channel, file);
                self.audit
                    .record("gateway", "pairing.request", &format!("{channel}:{sender}"), None);
                GateDecision::PairingCreated { code }
            }
        }
    }

    /// Pending requests, optionally filtered by channel.
    pub fn list(&self, channel: Option<&str>) -> Vec<PairingEntry> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(ch) = channel {
            let ch = ch.to_lowercase();
            self.load_channel_locked(&mut channels, &ch);
        } else {
            self.load_all_locked(&mut channels);
        }

        let now = Utc::now().timestamp_millis();
        let mut out = Vec::new();
        for (name, file) in channels.iter_mut() {
            if channel.is_some_and(|c| !c.eq_ignore_ascii_case(name)) {
                continue;
            }
            purge_expired(file, now);
            for p in &file.pending {
                out.push(PairingEntry {
                    channel: name.clone(),
                    sender: p.sender.clone(),
                    code: p.code.clone(),
                    created_at_ms: p.created_at_ms,
                    ttl_ms: p.ttl_ms,
                });
            }
        }
        out.sort_by(|a, b| (a.channel.as_str(), a.created_at_ms).cmp(&(b.channel.as_str(), b.created_at_ms)));
        out
    }

    /// Promote a pending sender to the allowlist. Idempotent: approving an
    /// already-allowed sender changes nothing and returns `false`.
    pub fn approve(&self, channel: &str, sender: &str, actor: &str) -> anyhow::Result<bool> {
        let channel = channel.to_lowercase();
        let mut channels = self.channels.lock().unwrap();
        let file = self.load_channel_locked(&mut channels, &channel);

        file.pending.retain(|p| p.sender != sender);
        if is_allowed(file, sender) {
            return Ok(false);
        }
        file.allow.push(sender.to_string());
        self.persist_channel(&channel, file)?;
        info!(channel, sender, actor, "pairing approved");
        self.audit
            .record(actor, "pairing.approve", &format!("{channel}:{sender}"), None);
        Ok(true)
    }

    /// Drop a pending request without promoting the sender.
    pub fn deny(&self, channel: &str, sender: &str, actor: &str) -> anyhow::Result<bool> {
        let channel = channel.to_lowercase();
        let mut channels = self.channels.lock().unwrap();
        let file = self.load_channel_locked(&mut channels, &channel);

        let before = file.pending.len();
        file.pending.retain(|p| p.sender != sender);
        let removed = file.pending.len() != before;
        if removed {
            self.persist_channel(&channel, file)?;
            self.audit
                .record(actor, "pairing.deny", &format!("{channel}:{sender}"), None);
        }
        Ok(removed)
    }

    /// Administrative allowlist entry (including the `"*"` wildcard used
    /// by `open` channels).
    pub fn add_allow(&self, channel: &str, entry: &str, actor: &str) -> anyhow::Result<()> {
        let channel = channel.to_lowercase();
        let mut channels = self.channels.lock().unwrap();
        let file = self.load_channel_locked(&mut channels, &channel);
        if !file.allow.iter().any(|a| a == entry) {
            file.allow.push(entry.to_string());
            self.persist_channel(&channel, file)?;
            self.audit
                .record(actor, "pairing.allow", &format!("{channel}:{entry}"), None);
        }
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn load_channel_locked<'a>(
        &self,
        channels: &'a mut HashMap<String, ChannelFile>,
        channel: &str,
    ) -> &'a mut ChannelFile {
        if !channels.contains_key(channel) {
            let path = self.state.pairing_file(channel);
            let file = if path.is_file() {
                std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|t| serde_json::from_str(&t).ok())
                    .unwrap_or_default()
            } else {
                ChannelFile::default()
            };
            channels.insert(channel.to_string(), file);
        }
        channels.get_mut(channel).expect("just inserted")
    }

    fn load_all_locked(&self, channels: &mut HashMap<String, ChannelFile>) {
        let dir = self.state.root().join("pairing");
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(channel) = name.strip_suffix(".json") {
                self.load_channel_locked(channels, channel);
            }
        }
    }

    fn persist_channel(&self, channel: &str, file: &ChannelFile) -> anyhow::Result<()> {
        let path = self.state.pairing_file(channel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(file).context("serializing pairing state")?;
        std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))
    }
}

fn is_allowed(file: &ChannelFile, sender: &str) -> bool {
    file.allow.iter().any(|a| a == sender || a == "*")
}

fn purge_expired(file: &mut ChannelFile, now: i64) {
    file.pending
        .retain(|p| now < p.created_at_ms + p.ttl_ms.max(0));
}

/// Short pairing code: 8 characters, confusable glyphs excluded.
fn generate_code() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = OsRng;
    (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(config_json: &str) -> (Arc<PairingStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let config: Config = serde_json::from_str(config_json).unwrap();
        let audit = Arc::new(AuditLog::new(state.audit_file()));
        (
            Arc::new(PairingStore::new(state, Arc::new(config), audit)),
            dir,
        )
    }

    const PAIRING_X: &str =
        r#"{"channels": {"x": {"policy": "pairing"}}, "pairing": {"maxPending": 2}}"#;

    // ── Pairing policy ────────────────────────────────────────────────────────

    #[test]
    fn unknown_sender_gets_a_code() {
        let (store, _dir) = store_with(PAIRING_X);
        match store.gate("x", "alice") {
            GateDecision::PairingCreated { code } => {
                assert_eq!(code.len(), 8);
            }
            other => panic!("expected PairingCreated, got {other:?}"),
        }
        assert_eq!(store.list(Some("x")).len(), 1);
    }

    #[test]
    fn repeat_contact_refreshes_without_duplicating() {
        let (store, _dir) = store_with(PAIRING_X);
        store.gate("x", "alice");
        assert_eq!(store.gate("x", "alice"), GateDecision::PairingPending);
        assert_eq!(store.list(Some("x")).len(), 1);
    }

    #[test]
    fn pending_cap_evicts_oldest_never_exceeds() {
        let (store, _dir) = store_with(PAIRING_X);
        store.gate("x", "a");
        store.gate("x", "b");
        store.gate("x", "c");
        let pending = store.list(Some("x"));
        assert_eq!(pending.len(), 2, "cap is 2, never three pending");
        let senders: Vec<&str> = pending.iter().map(|p| p.sender.as_str()).collect();
        assert!(!senders.contains(&"a"), "oldest must be evicted");
        assert!(senders.contains(&"b") && senders.contains(&"c"));
    }

    #[test]
    fn concurrent_inserts_respect_the_cap() {
        let (store, _dir) = store_with(PAIRING_X);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.gate("x", &format!("sender-{i}"));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(store.list(Some("x")).len() <= 2);
    }

    #[test]
    fn approve_promotes_and_admits_without_new_request() {
        let (store, _dir) = store_with(PAIRING_X);
        store.gate("x", "alice");
        assert!(store.approve("x", "alice", "op-1").unwrap());

        assert_eq!(store.gate("x", "alice"), GateDecision::Admit);
        assert!(store.list(Some("x")).is_empty(), "no new pairing request");
    }

    #[test]
    fn approve_twice_is_noop() {
        let (store, _dir) = store_with(PAIRING_X);
        store.gate("x", "alice");
        assert!(store.approve("x", "alice", "op").unwrap());
        assert!(!store.approve("x", "alice", "op").unwrap());
    }

    #[test]
    fn deny_drops_the_request() {
        let (store, _dir) = store_with(PAIRING_X);
        store.gate("x", "mallory");
        assert!(store.deny("x", "mallory", "op").unwrap());
        assert!(store.list(Some("x")).is_empty());
        // Still not allowed.
        assert!(matches!(
            store.gate("x", "mallory"),
            GateDecision::PairingCreated { .. }
        ));
    }

    #[test]
    fn expired_requests_are_purged() {
        let (store, _dir) = store_with(
            r#"{"channels": {"x": {"policy": "pairing"}}, "pairing": {"ttlSecs": 0}}"#,
        );
        store.gate("x", "alice");
        assert!(store.list(Some("x")).is_empty(), "ttl 0 expires immediately");
    }

    // ── Other policies ────────────────────────────────────────────────────────

    #[test]
    fn disabled_channel_drops_everything() {
        let (store, _dir) = store_with(r#"{"channels": {"x": {"policy": "disabled"}}}"#);
        assert_eq!(store.gate("x", "anyone"), GateDecision::Drop);
    }

    #[test]
    fn open_channel_requires_wildcard_entry() {
        let (store, _dir) = store_with(r#"{"channels": {"x": {"policy": "open"}}}"#);
        assert_eq!(store.gate("x", "anyone"), GateDecision::Drop);
        store.add_allow("x", "*", "op").unwrap();
        assert_eq!(store.gate("x", "anyone"), GateDecision::Admit);
    }

    #[test]
    fn allowlist_channel_admits_only_listed_senders() {
        let (store, _dir) = store_with(r#"{"channels": {"x": {"policy": "allowlist"}}}"#);
        store.add_allow("x", "alice", "op").unwrap();
        assert_eq!(store.gate("x", "alice"), GateDecision::Admit);
        assert_eq!(store.gate("x", "bob"), GateDecision::Drop);
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let config: Arc<Config> = Arc::new(serde_json::from_str(PAIRING_X).unwrap());
        let audit = Arc::new(AuditLog::new(state.audit_file()));

        {
            let store = PairingStore::new(state.clone(), config.clone(), audit.clone());
            store.gate("x", "alice");
            store.approve("x", "alice", "op").unwrap();
            store.gate("x", "bob");
        }
        let store = PairingStore::new(state, config, audit);
        assert_eq!(store.gate("x", "alice"), GateDecision::Admit);
        let pending = store.list(Some("x"));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sender, "bob");
    }
}
