// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Who authored a message in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One prompt message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Links a `Tool` message back to the call it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool offered to the model for this turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One completion request — the full prompt for a single model round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

/// Events a provider emits while streaming one completion.
///
/// The sequence is finite and single-shot: zero or more deltas and tool
/// calls, terminated by exactly one `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A streamed chunk of assistant text.
    TextDelta(String),
    /// The model requests a tool invocation.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Terminal event; no further events follow.
    Done,
}

/// Provider failure, split by whether a retry can help.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// 5xx-class / transport errors. The driver retries these with capped
    /// exponential backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Invalid input, quota exhaustion, deterministic refusal. Terminal
    /// for the turn.
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
