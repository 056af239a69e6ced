// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Approval table — pending human-in-the-loop decisions.
//!
//! One approval binds to exactly one exec request id. The first valid
//! resolution wins atomically; every later attempt gets `ALREADY_RESOLVED`
//! (that includes resolutions arriving after a timeout — a token is
//! single-use, full stop). Resolved ids are remembered so replay is
//! distinguishable from "never existed".

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use porter_proto::{ApprovalDecision, ApprovalEntry};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("approval already resolved")]
    AlreadyResolved,

    #[error("approval not found")]
    NotFound,
}

struct Pending {
    entry: ApprovalEntry,
    tx: oneshot::Sender<ApprovalDecision>,
}

/// Pending approvals plus the tombstone set of resolved ids.
#[derive(Default)]
pub struct ApprovalTable {
    pending: Mutex<HashMap<String, Pending>>,
    resolved: Mutex<HashSet<String>>,
}

impl ApprovalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending approval bound to one exec request. Returns the
    /// approval id, the broadcastable entry, and the receiver the exec
    /// plane awaits.
    pub fn request(
        &self,
        session_key: &str,
        command: &str,
        host: &str,
        reason: &str,
        ttl_ms: i64,
    ) -> (ApprovalEntry, oneshot::Receiver<ApprovalDecision>) {
        let entry = ApprovalEntry {
            approval_id: Uuid::new_v4().to_string(),
            session_key: session_key.to_string(),
            command: command.to_string(),
            host: host.to_string(),
            reason: Some(reason.to_string()),
            requested_at_ms: Utc::now().timestamp_millis(),
            ttl_ms,
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            entry.approval_id.clone(),
            Pending {
                entry: entry.clone(),
                tx,
            },
        );
        (entry, rx)
    }

    /// Resolve a pending approval. First valid resolution wins; everything
    /// after it is rejected atomically.
    pub fn resolve(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        resolved_by: &str,
    ) -> Result<ApprovalEntry, ResolveError> {
        // Take under the pending lock, then mark resolved before releasing
        // anything to the caller — check-then-act is one critical section
        // per map, remove is the atomic point.
        let taken = self.pending.lock().unwrap().remove(approval_id);
        match taken {
            Some(pending) => {
                self.resolved
                    .lock()
                    .unwrap()
                    .insert(approval_id.to_string());
                info!(approval_id, ?decision, resolved_by, "approval resolved");
                // Receiver gone means the exec side timed out concurrently;
                // the resolution still counts as consumed.
                let _ = pending.tx.send(decision);
                Ok(pending.entry)
            }
            None => {
                if self.resolved.lock().unwrap().contains(approval_id) {
                    Err(ResolveError::AlreadyResolved)
                } else {
                    Err(ResolveError::NotFound)
                }
            }
        }
    }

    /// Expire a pending approval (timeout path). The id becomes a
    /// tombstone so a late operator resolution replays as
    /// `ALREADY_RESOLVED` rather than `NOT_FOUND`.
    pub fn expire(&self, approval_id: &str) -> bool {
        let removed = self.pending.lock().unwrap().remove(approval_id).is_some();
        if removed {
            self.resolved
                .lock()
                .unwrap()
                .insert(approval_id.to_string());
            info!(approval_id, "approval timed out");
        }
        removed
    }

    /// Snapshot of pending approvals, oldest first.
    pub fn list(&self) -> Vec<ApprovalEntry> {
        let mut entries: Vec<_> = self
            .pending
            .lock()
            .unwrap()
            .values()
            .map(|p| p.entry.clone())
            .collect();
        entries.sort_by_key(|e| e.requested_at_ms);
        entries
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_one() -> (ApprovalTable, String, oneshot::Receiver<ApprovalDecision>) {
        let t = ApprovalTable::new();
        let (entry, rx) = t.request("web:default:dm:u1", "uname -a", "node:n1", "miss", 60_000);
        (t, entry.approval_id, rx)
    }

    #[tokio::test]
    async fn first_resolution_wins_and_delivers() {
        let (t, id, rx) = table_with_one();
        let entry = t
            .resolve(&id, ApprovalDecision::AllowOnce, "operator-1")
            .unwrap();
        assert_eq!(entry.command, "uname -a");
        assert_eq!(rx.await.unwrap(), ApprovalDecision::AllowOnce);
    }

    #[tokio::test]
    async fn second_resolution_is_already_resolved() {
        let (t, id, _rx) = table_with_one();
        t.resolve(&id, ApprovalDecision::AllowOnce, "op-1").unwrap();
        let err = t
            .resolve(&id, ApprovalDecision::Deny, "op-2")
            .unwrap_err();
        assert_eq!(err, ResolveError::AlreadyResolved);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let t = ApprovalTable::new();
        assert_eq!(
            t.resolve("nope", ApprovalDecision::Deny, "op").unwrap_err(),
            ResolveError::NotFound
        );
    }

    #[tokio::test]
    async fn resolution_after_expiry_is_already_resolved() {
        let (t, id, rx) = table_with_one();
        assert!(t.expire(&id));
        drop(rx);
        let err = t
            .resolve(&id, ApprovalDecision::AllowOnce, "late-op")
            .unwrap_err();
        assert_eq!(err, ResolveError::AlreadyResolved);
    }

    #[tokio::test]
    async fn expire_of_resolved_id_is_noop() {
        let (t, id, _rx) = table_with_one();
        t.resolve(&id, ApprovalDecision::Deny, "op").unwrap();
        assert!(!t.expire(&id));
    }

    #[tokio::test]
    async fn list_shows_pending_until_resolution() {
        let (t, id, _rx) = table_with_one();
        assert_eq!(t.list().len(), 1);
        t.resolve(&id, ApprovalDecision::Deny, "op").unwrap();
        assert!(t.list().is_empty());
    }

    #[tokio::test]
    async fn concurrent_resolutions_have_one_winner() {
        let t = std::sync::Arc::new(ApprovalTable::new());
        let (entry, _rx) = t.request("k", "cmd", "gateway", "r", 1000);
        let id = entry.approval_id;

        let mut wins = 0;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = t.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                t.resolve(&id, ApprovalDecision::AllowOnce, "op").is_ok()
            }));
        }
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1, "exactly one resolution may win");
    }
}
