// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::provider::{ModelProvider, ModelStream};
use crate::types::{CompletionRequest, ModelError, ModelEvent, Role};

/// Deterministic mock provider for tests. Echoes the last user message back
/// as the assistant response, split into two deltas so stream consumers are
/// exercised with more than one chunk.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, req: CompletionRequest) -> Result<ModelStream, ModelError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "[no input]".to_string());

        let mid = reply.len() / 2;
        // Split on a char boundary; multibyte text falls back to one delta.
        let events = if reply.is_char_boundary(mid) && mid > 0 {
            vec![
                Ok(ModelEvent::TextDelta(reply[..mid].to_string())),
                Ok(ModelEvent::TextDelta(reply[mid..].to_string())),
                Ok(ModelEvent::Done),
            ]
        } else {
            vec![Ok(ModelEvent::TextDelta(reply)), Ok(ModelEvent::Done)]
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted provider. Each `stream` call pops the next script off the
/// front of the queue, so tests can drive exact event sequences — including
/// tool-call rounds — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<ModelEvent>>>>,
    /// The last request seen, for assertions on prompt assembly.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    /// The outer `Vec` is the ordered list of rounds; the inner `Vec` is the
    /// event sequence for that round.
    pub fn new(scripts: Vec<Vec<ModelEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: a provider that always answers with one text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ModelEvent::TextDelta(reply.into()),
            ModelEvent::Done,
        ]])
    }

    /// Convenience: tool call in round one, text reply in round two.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        arguments: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ModelEvent::ToolCall {
                    id: call_id.into(),
                    name: tool.into(),
                    arguments,
                },
                ModelEvent::Done,
            ],
            vec![ModelEvent::TextDelta(final_text.into()), ModelEvent::Done],
        ])
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, req: CompletionRequest) -> Result<ModelStream, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    ModelEvent::TextDelta("[no more scripts]".into()),
                    ModelEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<ModelEvent, ModelError>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// Fails the first `failures` calls with a transient error, then behaves
/// like [`MockProvider`]. Drives the driver's backoff-and-retry path.
pub struct FlakyProvider {
    failures: usize,
    calls: AtomicUsize,
    inner: MockProvider,
}

impl FlakyProvider {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
            inner: MockProvider,
        }
    }

    /// How many calls this provider has seen.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn stream(&self, req: CompletionRequest) -> Result<ModelStream, ModelError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(ModelError::Transient(format!("simulated 503 (call {n})")));
        }
        self.inner.stream(req).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use futures::StreamExt;

    fn req(text: &str) -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    async fn collect(mut s: ModelStream) -> Vec<ModelEvent> {
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let events = collect(p.stream(req("hello world")).await.unwrap()).await;
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ModelEvent::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello world");
        assert_eq!(events.last(), Some(&ModelEvent::Done));
    }

    #[tokio::test]
    async fn scripted_pops_rounds_in_order() {
        let p = ScriptedProvider::tool_then_text(
            "c1",
            "exec",
            serde_json::json!({"command": "uname -a"}),
            "done",
        );

        let round1 = collect(p.stream(req("run it")).await.unwrap()).await;
        assert!(round1
            .iter()
            .any(|e| matches!(e, ModelEvent::ToolCall { name, .. } if name == "exec")));

        let round2 = collect(p.stream(req("continue")).await.unwrap()).await;
        assert!(round2
            .iter()
            .any(|e| matches!(e, ModelEvent::TextDelta(t) if t == "done")));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedProvider::always_text("ok");
        let _ = p.stream(req("inspect me")).await.unwrap();
        let seen = p.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(seen.messages[0].content, "inspect me");
    }

    #[tokio::test]
    async fn flaky_fails_then_recovers() {
        let p = FlakyProvider::new(2);
        assert!(p.stream(req("a")).await.is_err());
        assert!(p.stream(req("b")).await.is_err());
        assert!(p.stream(req("c")).await.is_ok());
        assert_eq!(p.calls(), 3);
    }

    #[tokio::test]
    async fn flaky_errors_are_transient() {
        let p = FlakyProvider::new(1);
        let err = p.stream(req("x")).await.err().unwrap();
        assert!(err.is_transient());
    }
}
