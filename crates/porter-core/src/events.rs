// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Turn events and the per-session system-event ring.
//!
//! A turn produces a finite, single-shot, strictly ordered stream of
//! [`TurnEvent`]s. Sequence numbers are assigned centrally by the emitter
//! (`1, 2, …, N`, no gaps, no duplicates) so every subscriber observes the
//! same ordering — that is the invariant operator UIs rely on to detect
//! lost frames.

use porter_proto::StreamKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session_key::SessionKey;

// ── Turn events ───────────────────────────────────────────────────────────────

/// Terminal and non-terminal lifecycle markers of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleKind {
    Started,
    Done,
    Cancelled,
    Failed,
    DeliveryFailed,
}

/// One event in a turn's ordered stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    /// A streamed chunk of assistant text.
    AssistantDelta { text: String },
    /// A complete assistant message (deltas accumulated). The outbound
    /// router delivers these.
    AssistantMessage { text: String },
    ToolCallStart {
        id: String,
        name: String,
        args: Value,
    },
    ToolCallEnd {
        id: String,
        result: String,
        is_error: bool,
    },
    /// An exec approval is pending for this turn.
    ApprovalRequested { id: String, details: Value },
    Lifecycle {
        kind: LifecycleKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl TurnEvent {
    /// Which wire sub-stream this event belongs to.
    pub fn stream_kind(&self) -> StreamKind {
        match self {
            TurnEvent::AssistantDelta { .. } | TurnEvent::AssistantMessage { .. } => {
                StreamKind::Assistant
            }
            TurnEvent::ToolCallStart { .. }
            | TurnEvent::ToolCallEnd { .. }
            | TurnEvent::ApprovalRequested { .. } => StreamKind::Tool,
            TurnEvent::Lifecycle { .. } => StreamKind::Lifecycle,
        }
    }

    /// True for events after which no further events may be emitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Lifecycle {
                kind: LifecycleKind::Done | LifecycleKind::Cancelled | LifecycleKind::Failed,
                ..
            }
        )
    }
}

/// A sequenced turn event as published to subscribers.
#[derive(Debug, Clone)]
pub struct TurnNotice {
    pub session_key: SessionKey,
    pub agent: String,
    pub run_id: String,
    pub seq: u64,
    pub event: TurnEvent,
}

// ── System-event ring ─────────────────────────────────────────────────────────

/// Per-session bounded FIFO of notes surfaced at the top of the next turn's
/// prompt: exec outcomes, approval results, pairing notifications, cron
/// triggers. Overflow drops the oldest entries; the drop is made visible to
/// the model with an explicit marker on drain.
#[derive(Debug)]
pub struct SystemEventRing {
    entries: std::collections::VecDeque<String>,
    capacity: usize,
    dropped: usize,
}

impl SystemEventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: std::collections::VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, note: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(note.into());
    }

    /// Atomically take everything, oldest first. A drop marker is prepended
    /// when the ring overflowed since the last drain.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.entries.len() + 1);
        if self.dropped > 0 {
            out.push(format!("({} earlier events dropped)", self.dropped));
            self.dropped = 0;
        }
        out.extend(self.entries.drain(..));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.dropped == 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── TurnEvent ─────────────────────────────────────────────────────────────

    #[test]
    fn stream_kinds_match_event_families() {
        assert_eq!(
            TurnEvent::AssistantDelta { text: "x".into() }.stream_kind(),
            StreamKind::Assistant
        );
        assert_eq!(
            TurnEvent::ToolCallEnd {
                id: "1".into(),
                result: "".into(),
                is_error: false
            }
            .stream_kind(),
            StreamKind::Tool
        );
        assert_eq!(
            TurnEvent::Lifecycle {
                kind: LifecycleKind::Done,
                detail: None
            }
            .stream_kind(),
            StreamKind::Lifecycle
        );
    }

    #[test]
    fn done_cancelled_failed_are_terminal() {
        for kind in [
            LifecycleKind::Done,
            LifecycleKind::Cancelled,
            LifecycleKind::Failed,
        ] {
            assert!(TurnEvent::Lifecycle { kind, detail: None }.is_terminal());
        }
        assert!(!TurnEvent::Lifecycle {
            kind: LifecycleKind::Started,
            detail: None
        }
        .is_terminal());
        assert!(!TurnEvent::AssistantDelta { text: "x".into() }.is_terminal());
    }

    #[test]
    fn lifecycle_serializes_with_kebab_case_kind() {
        let v = serde_json::to_value(TurnEvent::Lifecycle {
            kind: LifecycleKind::DeliveryFailed,
            detail: Some("slack send failed".into()),
        })
        .unwrap();
        assert_eq!(v["type"], "lifecycle");
        assert_eq!(v["kind"], "delivery-failed");
        assert_eq!(v["detail"], "slack send failed");
    }

    #[test]
    fn done_lifecycle_data_shape_is_kind_done() {
        let v = serde_json::to_value(TurnEvent::Lifecycle {
            kind: LifecycleKind::Done,
            detail: None,
        })
        .unwrap();
        assert_eq!(v["kind"], "done");
        assert!(v.get("detail").is_none());
    }

    // ── SystemEventRing ───────────────────────────────────────────────────────

    #[test]
    fn drain_returns_fifo_order() {
        let mut ring = SystemEventRing::new(4);
        ring.push("first");
        ring.push("second");
        assert_eq!(ring.drain(), vec!["first", "second"]);
        assert!(ring.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_with_marker() {
        let mut ring = SystemEventRing::new(2);
        ring.push("a");
        ring.push("b");
        ring.push("c");
        let drained = ring.drain();
        assert_eq!(
            drained,
            vec![
                "(1 earlier events dropped)".to_string(),
                "b".to_string(),
                "c".to_string()
            ]
        );
    }

    #[test]
    fn drop_counter_resets_after_drain() {
        let mut ring = SystemEventRing::new(1);
        ring.push("a");
        ring.push("b");
        let _ = ring.drain();
        ring.push("c");
        assert_eq!(ring.drain(), vec!["c"]);
    }

    #[test]
    fn empty_drain_is_empty() {
        let mut ring = SystemEventRing::new(8);
        assert!(ring.drain().is_empty());
    }
}
