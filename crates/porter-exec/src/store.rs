// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Durable exec allowlists — `exec-approvals.json`.
//!
//! ```json
//! {
//!   "defaults": { "allowlist": [ { "pattern": "/usr/bin/git", "lastUsedAt": 0 } ] },
//!   "agents": {
//!     "ops": {
//!       "security": "allowlist",
//!       "ask": "on-miss",
//!       "allowlist": [ { "pattern": "/usr/bin/uname", "host": "node:n1", "lastUsedAt": 0 } ]
//!     }
//!   }
//! }
//! ```
//!
//! Patterns are shell globs over the resolved binary path. An entry with no
//! `host` applies on every host. `allow-and-add` approvals append here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use porter_config::{AskMode, SecurityMode};
use porter_core::glob_to_regex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One durable allowlist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistEntry {
    /// Shell glob over the resolved binary path.
    pub pattern: String,
    /// Host the entry applies to; `None` = every host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub last_used_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<AskMode>,
    #[serde(default)]
    pub allowlist: Vec<AllowlistEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecApprovalsFile {
    #[serde(default)]
    pub defaults: AgentExecEntry,
    #[serde(default)]
    pub agents: HashMap<String, AgentExecEntry>,
}

/// Allowlist store. All mutation is a single critical section; every
/// mutation persists before returning.
pub struct ExecStore {
    path: PathBuf,
    file: Mutex<ExecApprovalsFile>,
}

impl ExecStore {
    /// Load from `path`; a missing file is an empty store.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = if path.is_file() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            ExecApprovalsFile::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            file: Mutex::new(ExecApprovalsFile::default()),
        }
    }

    /// Check the resolved binary against the effective allowlist for the
    /// agent on the given host; a hit refreshes the entry's `lastUsedAt`.
    pub fn matches(&self, agent: &str, host: &str, binary: &str) -> bool {
        let mut guard = self.file.lock().unwrap();
        let file = &mut *guard;
        let now = Utc::now().timestamp_millis();

        let mut hit = false;
        let lists = [
            file.agents.get_mut(agent).map(|a| &mut a.allowlist),
            Some(&mut file.defaults.allowlist),
        ];
        for list in lists.into_iter().flatten() {
            for entry in list.iter_mut() {
                if let Some(entry_host) = &entry.host {
                    if entry_host != host {
                        continue;
                    }
                }
                if glob_to_regex(&entry.pattern).is_some_and(|re| re.is_match(binary)) {
                    entry.last_used_at = now;
                    hit = true;
                    break;
                }
            }
            if hit {
                break;
            }
        }

        if hit {
            let _ = self.persist_locked(file);
        }
        hit
    }

    /// Append an entry for an agent (the `allow-and-add` path). Exact
    /// duplicates are refreshed instead of duplicated.
    pub fn add_entry(&self, agent: &str, pattern: &str, host: Option<&str>) -> anyhow::Result<()> {
        let mut file = self.file.lock().unwrap();
        let list = &mut file.agents.entry(agent.to_string()).or_default().allowlist;
        let now = Utc::now().timestamp_millis();

        if let Some(existing) = list
            .iter_mut()
            .find(|e| e.pattern == pattern && e.host.as_deref() == host)
        {
            existing.last_used_at = now;
        } else {
            info!(agent, pattern, ?host, "allowlist entry added");
            list.push(AllowlistEntry {
                pattern: pattern.to_string(),
                host: host.map(String::from),
                last_used_at: now,
            });
        }
        self.persist_locked(&file)
    }

    /// Snapshot an agent's entries (its own plus the defaults).
    pub fn entries(&self, agent: &str) -> Vec<AllowlistEntry> {
        let file = self.file.lock().unwrap();
        let mut out: Vec<AllowlistEntry> = file
            .agents
            .get(agent)
            .map(|a| a.allowlist.clone())
            .unwrap_or_default();
        out.extend(file.defaults.allowlist.clone());
        out
    }

    fn persist_locked(&self, file: &ExecApprovalsFile) -> anyhow::Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let text = serde_json::to_string_pretty(file).context("serializing exec approvals")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_matches_nothing() {
        let store = ExecStore::in_memory();
        assert!(!store.matches("default", "gateway", "/usr/bin/uname"));
    }

    #[test]
    fn added_entry_matches_and_is_scoped_to_agent() {
        let store = ExecStore::in_memory();
        store.add_entry("ops", "/usr/bin/uname", None).unwrap();
        assert!(store.matches("ops", "gateway", "/usr/bin/uname"));
        assert!(!store.matches("other", "gateway", "/usr/bin/uname"));
    }

    #[test]
    fn glob_patterns_match_path_prefixes() {
        let store = ExecStore::in_memory();
        store.add_entry("default", "/usr/bin/*", None).unwrap();
        assert!(store.matches("default", "gateway", "/usr/bin/git"));
        assert!(!store.matches("default", "gateway", "/opt/bin/git"));
    }

    #[test]
    fn host_scoped_entry_only_matches_its_host() {
        let store = ExecStore::in_memory();
        store
            .add_entry("default", "/usr/bin/uname", Some("node:n1"))
            .unwrap();
        assert!(store.matches("default", "node:n1", "/usr/bin/uname"));
        assert!(!store.matches("default", "gateway", "/usr/bin/uname"));
    }

    #[test]
    fn duplicate_add_refreshes_instead_of_duplicating() {
        let store = ExecStore::in_memory();
        store.add_entry("a", "/bin/ls", None).unwrap();
        store.add_entry("a", "/bin/ls", None).unwrap();
        assert_eq!(
            store
                .entries("a")
                .iter()
                .filter(|e| e.pattern == "/bin/ls")
                .count(),
            1
        );
    }

    #[test]
    fn match_refreshes_last_used_at() {
        let store = ExecStore::in_memory();
        store.add_entry("a", "/bin/ls", None).unwrap();
        // Zero out to observe the refresh.
        store.file.lock().unwrap().agents.get_mut("a").unwrap().allowlist[0].last_used_at = 0;
        assert!(store.matches("a", "gateway", "/bin/ls"));
        assert!(store.entries("a")[0].last_used_at > 0);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec-approvals.json");
        {
            let store = ExecStore::load(&path).unwrap();
            store.add_entry("ops", "/usr/bin/uname", None).unwrap();
        }
        let reloaded = ExecStore::load(&path).unwrap();
        assert!(reloaded.matches("ops", "gateway", "/usr/bin/uname"));
    }

    #[test]
    fn defaults_apply_to_every_agent() {
        let store = ExecStore::in_memory();
        store
            .file
            .lock()
            .unwrap()
            .defaults
            .allowlist
            .push(AllowlistEntry {
                pattern: "/bin/echo".into(),
                host: None,
                last_used_at: 0,
            });
        assert!(store.matches("anyone", "gateway", "/bin/echo"));
    }
}
