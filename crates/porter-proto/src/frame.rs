// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Frame codec — the three frame kinds that travel on a control connection.
//!
//! Frames are JSON objects discriminated by a `"type"` field:
//!
//! | kind    | fields                                | direction        |
//! |---------|---------------------------------------|------------------|
//! | `req`   | `id`, `method`, `params`              | client → gateway |
//! | `res`   | `id`, `ok`, `payload?`, `error?`      | gateway → client |
//! | `event` | `event`, `payload`, `seq?`            | gateway → client |
//!
//! The codec validates shape only. Method params are opaque
//! `serde_json::Value`s here; the dispatcher deserializes them against the
//! typed structs in [`crate::methods`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Hard ceiling on a single encoded frame. Oversized frames are rejected
/// before JSON parsing to bound memory per connection.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

// ── Error codes ───────────────────────────────────────────────────────────────

/// Typed error codes returned in `res.error.code`.
///
/// These names are normative wire strings; clients match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    UnknownMethod,
    InvalidRequest,
    VersionMismatch,
    NotFound,
    Conflict,
    AlreadyResolved,
    ExecDenied,
    Timeout,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Serialize through serde so Display always matches the wire string.
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// A typed error carried in a `res` frame.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client request. `id` is echoed back in the matching `res`.
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },

    /// Gateway response to a `req` with the same `id`.
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },

    /// Server-initiated event. `seq` is present for per-run ordered streams.
    Event {
        event: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    /// A successful response carrying `payload`.
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Frame::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// An error response with a typed code.
    pub fn err(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(WireError::new(code, message)),
        }
    }

    /// An event frame without a sequence number.
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
            seq: None,
        }
    }

    /// An event frame belonging to an ordered per-run stream.
    pub fn seq_event(event: impl Into<String>, payload: Value, seq: u64) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
            seq: Some(seq),
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes ({0} bytes)")]
    TooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a frame as a JSON string (one WebSocket text message).
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode one frame from a JSON string, enforcing the size ceiling first.
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
