// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Inbound debouncer — per-session coalescing of bursty messages.
//!
//! Chat users send three short messages where one was meant. Instead of
//! scheduling three agent turns, the session worker buffers inbound
//! messages for the channel's configured window and delivers them as a
//! single composite input, original arrival timestamps preserved. A new
//! message inside the window extends the deadline; a forced flush (control
//! command) delivers immediately.
//!
//! The buffer itself is synchronous state owned by the session worker; the
//! worker sleeps on [`Debouncer::deadline`] inside its `select!` loop.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// One buffered inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub text: String,
    pub at: DateTime<Utc>,
}

/// The composite handed to the turn scheduler when a window closes.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedInput {
    pub messages: Vec<InboundMessage>,
}

impl FlushedInput {
    /// Join buffered texts in arrival order for the prompt.
    pub fn composite_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Arrival timestamp of the first buffered message.
    pub fn first_at(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|m| m.at)
    }
}

/// Per-session debounce buffer.
#[derive(Debug)]
pub struct Debouncer {
    window: std::time::Duration,
    buffer: Vec<InboundMessage>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window,
            buffer: Vec::new(),
            deadline: None,
        }
    }

    /// Buffer a message and start or extend the window.
    ///
    /// With a zero window the deadline is "now": the worker's next poll
    /// flushes immediately, so zero-window channels skip coalescing without
    /// a separate code path.
    pub fn push(&mut self, msg: InboundMessage) {
        self.buffer.push(msg);
        self.deadline = Some(Instant::now() + self.window);
    }

    /// The instant the worker should wake to flush, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True when the window has elapsed and a flush is due.
    pub fn is_ready(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Take everything buffered, in arrival order. Returns `None` when the
    /// buffer is empty (e.g. a forced flush raced a timer flush).
    pub fn flush(&mut self) -> Option<FlushedInput> {
        self.deadline = None;
        if self.buffer.is_empty() {
            return None;
        }
        Some(FlushedInput {
            messages: std::mem::take(&mut self.buffer),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
