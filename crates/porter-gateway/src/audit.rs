// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Append-only audit trail for security-relevant mutations: pairing
//! decisions, approval resolutions, allowlist changes, token rotations.
//!
//! One JSON object per line in `<stateDir>/audit.jsonl`. This is the one
//! place raw (pre-canonicalization) peer ids may appear.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    at: String,
    actor: &'a str,
    action: &'a str,
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

/// Audit log appender. Cheap to share; writes are serialized.
pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Append one record. Audit failures are logged, never propagated — a
    /// full disk must not take the control plane down.
    pub fn record(&self, actor: &str, action: &str, subject: &str, detail: Option<&str>) {
        let record = AuditRecord {
            at: Utc::now().to_rfc3339(),
            actor,
            action,
            subject,
            detail,
        };
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };
        let _guard = self.lock.lock().unwrap();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!("audit append failed: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_appended_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.record("op-1", "pairing.approve", "telegram:alice", None);
        log.record("op-2", "approval.resolve", "appr-9", Some("deny"));

        let text = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "pairing.approve");
        assert!(first.get("detail").is_none());
    }
}
