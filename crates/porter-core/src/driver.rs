// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Agent run driver — executes exactly one turn.
//!
//! The driver is orchestration, not generation: it assembles the prompt
//! (drained system events + transcript head + the flushed inbound
//! composite), offers the policy-filtered tool surface, consumes the
//! provider's event stream, dispatches tool calls, and emits the turn's
//! ordered event sequence. It owns no session state; the scheduler hands it
//! everything it needs for the one turn and awaits the terminal state.
//!
//! # Failure handling
//!
//! Transient provider errors are retried with capped exponential backoff
//! (base 250 ms, doubling, capped at 30 s, at most 5 attempts). Fatal
//! errors end the turn with `{lifecycle: failed}`. A cancelled token is
//! honored at every suspension point — between stream events, inside
//! backoff sleeps, and around tool dispatch — and yields a terminal
//! `{lifecycle: cancelled}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use porter_config::AgentConfig;
use porter_model::{CompletionRequest, Message, ModelProvider, ModelStream, ToolSpec};
use regex::Regex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{LifecycleKind, TurnEvent, TurnNotice};
use crate::glob::{any_match, compile_globs};
use crate::session::TranscriptLog;
use crate::session_key::SessionKey;

/// Retry schedule for transient provider failures.
const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_CAP: Duration = Duration::from_secs(30);
const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Ceiling on tool rounds within one turn. A model stuck in a tool loop
/// ends the turn as failed instead of spinning forever.
const MAX_TOOL_ROUNDS: usize = 32;

// ── Tool surface ──────────────────────────────────────────────────────────────

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn err(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// The tool surface offered to a turn. The gateway wires exec, outbound
/// send, and the rest in here; the driver only filters and dispatches.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// All tools that exist, before per-agent policy filtering.
    fn specs(&self) -> Vec<ToolSpec>;

    /// Run one tool call to completion. Implementations surface their own
    /// failures through `ToolCallResult::err` — a tool error is fed back to
    /// the model, it does not end the turn.
    ///
    /// `emitter` lets long-running tools publish mid-call turn events (the
    /// exec plane emits `approval-requested` through it) without breaking
    /// the turn's single ordered sequence.
    async fn dispatch(
        &self,
        session_key: &SessionKey,
        run_id: &str,
        call: ToolCallRequest,
        emitter: &mut TurnEmitter,
    ) -> ToolCallResult;
}

/// A dispatcher with no tools, for prompt-only agents and tests.
pub struct NoTools;

#[async_trait]
impl ToolDispatcher for NoTools {
    fn specs(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    async fn dispatch(
        &self,
        _session_key: &SessionKey,
        _run_id: &str,
        call: ToolCallRequest,
        _emitter: &mut TurnEmitter,
    ) -> ToolCallResult {
        ToolCallResult::err(format!("unknown tool: {}", call.name))
    }
}

/// Per-agent tool allow/deny predicate. Deny wins over allow; a tool not
/// matched by any allow pattern is denied.
///
/// Sub-agent tools (`subagent.*`) are a separate policy family: they are
/// matched against `subagents_allow` only, so a blanket `tools_allow:
/// ["*"]` never implicitly grants agent spawning.
#[derive(Debug)]
pub struct ToolPolicy {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    subagents: Vec<Regex>,
}

impl ToolPolicy {
    pub fn from_agent(agent: &AgentConfig) -> Self {
        Self {
            allow: compile_globs(&agent.tools_allow),
            deny: compile_globs(&agent.tools_deny),
            subagents: compile_globs(&agent.subagents_allow),
        }
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        if let Some(subagent) = tool_name.strip_prefix("subagent.") {
            return any_match(&self.subagents, subagent);
        }
        if any_match(&self.deny, tool_name) {
            return false;
        }
        any_match(&self.allow, tool_name)
    }
}

// ── Emitter ───────────────────────────────────────────────────────────────────

/// Assigns the strictly increasing per-turn sequence and publishes to the
/// shared notice stream. One emitter per turn; the scheduler discards it
/// after the terminal event.
pub struct TurnEmitter {
    notices: broadcast::Sender<TurnNotice>,
    session_key: SessionKey,
    agent: String,
    run_id: String,
    next_seq: u64,
}

impl TurnEmitter {
    pub fn new(
        notices: broadcast::Sender<TurnNotice>,
        session_key: SessionKey,
        agent: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            notices,
            session_key,
            agent: agent.into(),
            run_id: run_id.into(),
            next_seq: 0,
        }
    }

    /// Publish one event, returning its sequence number.
    pub fn emit(&mut self, event: TurnEvent) -> u64 {
        self.next_seq += 1;
        // No subscribers is fine — nobody is watching this session yet.
        let _ = self.notices.send(TurnNotice {
            session_key: self.session_key.clone(),
            agent: self.agent.clone(),
            run_id: self.run_id.clone(),
            seq: self.next_seq,
            event,
        });
        self.next_seq
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

// ── Turn execution ────────────────────────────────────────────────────────────

/// Everything a single turn needs, assembled by the scheduler.
pub struct TurnContext {
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<dyn ToolDispatcher>,
    pub transcript: Arc<TranscriptLog>,
    pub agent_name: String,
    pub agent: AgentConfig,
}

/// The flushed input a turn runs on.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub session_key: SessionKey,
    pub run_id: String,
    pub user_text: String,
    /// Drained system-event notes, surfaced in the prompt prelude.
    pub system_notes: Vec<String>,
    /// Advisory; echoed in the terminal lifecycle detail, nothing more.
    pub thinking: Option<bool>,
}

/// Terminal state of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Done,
    Cancelled,
    Failed,
}

/// Run one turn to its terminal event.
pub async fn run_turn(
    ctx: &TurnContext,
    input: TurnInput,
    cancel: CancellationToken,
    emitter: &mut TurnEmitter,
) -> TurnState {
    let policy = ToolPolicy::from_agent(&ctx.agent);
    let tool_specs: Vec<ToolSpec> = ctx
        .tools
        .specs()
        .into_iter()
        .filter(|t| policy.allows(&t.name))
        .collect();

    emitter.emit(TurnEvent::Lifecycle {
        kind: LifecycleKind::Started,
        detail: input.thinking.map(|t| format!("thinking={t}")),
    });

    // Prompt prelude: system prompt plus drained session notes.
    let mut system = ctx.agent.system_prompt.clone();
    if !input.system_notes.is_empty() {
        system.push_str("\n\nRecent session events:\n");
        for note in &input.system_notes {
            system.push_str("- ");
            system.push_str(note);
            system.push('\n');
        }
    }

    // Transcript head per the configured context window.
    let mut messages: Vec<Message> = Vec::new();
    match ctx
        .transcript
        .tail(&ctx.agent_name, &input.session_key, Some(ctx.agent.context_turns))
    {
        Ok(entries) => {
            for e in entries {
                match e.role.as_str() {
                    "user" => messages.push(Message::user(e.text)),
                    "assistant" => messages.push(Message::assistant(e.text)),
                    _ => {}
                }
            }
        }
        Err(e) => warn!(session = %input.session_key, "transcript head unavailable: {e}"),
    }

    if let Err(e) = ctx.transcript.append(
        &ctx.agent_name,
        &input.session_key,
        "user",
        &input.user_text,
    ) {
        warn!(session = %input.session_key, "transcript append failed: {e}");
    }
    messages.push(Message::user(input.user_text.clone()));

    // ── Stream loop: one round per model call, tool results feed the next ─────
    let mut final_text = String::new();
    for round in 0.. {
        if round == MAX_TOOL_ROUNDS {
            emitter.emit(TurnEvent::Lifecycle {
                kind: LifecycleKind::Failed,
                detail: Some(format!("tool round limit ({MAX_TOOL_ROUNDS}) exceeded")),
            });
            return TurnState::Failed;
        }

        let request = CompletionRequest {
            system: system.clone(),
            messages: messages.clone(),
            tools: tool_specs.clone(),
        };

        let stream = match stream_with_retry(ctx.provider.as_ref(), request, &cancel).await {
            RoundStart::Stream(s) => s,
            RoundStart::Cancelled => return finish_cancelled(emitter),
            RoundStart::Failed(msg) => {
                emitter.emit(TurnEvent::Lifecycle {
                    kind: LifecycleKind::Failed,
                    detail: Some(msg),
                });
                return TurnState::Failed;
            }
        };

        match consume_round(ctx, &input, stream, &cancel, emitter, &policy, &mut messages).await {
            RoundOutcome::ToolRound => continue,
            RoundOutcome::Final(text) => {
                final_text = text;
                break;
            }
            RoundOutcome::Cancelled => return finish_cancelled(emitter),
            RoundOutcome::Failed(msg) => {
                emitter.emit(TurnEvent::Lifecycle {
                    kind: LifecycleKind::Failed,
                    detail: Some(msg),
                });
                return TurnState::Failed;
            }
        }
    }

    if !final_text.is_empty() {
        emitter.emit(TurnEvent::AssistantMessage {
            text: final_text.clone(),
        });
        if let Err(e) = ctx.transcript.append(
            &ctx.agent_name,
            &input.session_key,
            "assistant",
            &final_text,
        ) {
            warn!(session = %input.session_key, "transcript append failed: {e}");
        }
    }

    emitter.emit(TurnEvent::Lifecycle {
        kind: LifecycleKind::Done,
        detail: None,
    });
    info!(session = %input.session_key, run = %input.run_id, "turn done");
    TurnState::Done
}

fn finish_cancelled(emitter: &mut TurnEmitter) -> TurnState {
    emitter.emit(TurnEvent::Lifecycle {
        kind: LifecycleKind::Cancelled,
        detail: None,
    });
    TurnState::Cancelled
}

enum RoundStart {
    Stream(ModelStream),
    Cancelled,
    Failed(String),
}

/// Open a model stream, retrying transient failures with capped backoff.
async fn stream_with_retry(
    provider: &dyn ModelProvider,
    request: CompletionRequest,
    cancel: &CancellationToken,
) -> RoundStart {
    let mut delay = RETRY_BASE;
    for attempt in 1..=RETRY_MAX_ATTEMPTS {
        // Biased: a cancelled token always wins over a ready stream.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RoundStart::Cancelled,
            r = provider.stream(request.clone()) => r,
        };
        match result {
            Ok(stream) => return RoundStart::Stream(stream),
            Err(e) if e.is_transient() && attempt < RETRY_MAX_ATTEMPTS => {
                debug!(attempt, "transient provider error, backing off: {e}");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return RoundStart::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(RETRY_CAP);
            }
            Err(e) => return RoundStart::Failed(e.to_string()),
        }
    }
    unreachable!("loop returns on last attempt");
}

enum RoundOutcome {
    /// At least one tool ran; the caller starts another round.
    ToolRound,
    /// The model finished with plain text.
    Final(String),
    Cancelled,
    Failed(String),
}

/// Consume one provider stream, dispatching tool calls as they arrive.
async fn consume_round(
    ctx: &TurnContext,
    input: &TurnInput,
    mut stream: ModelStream,
    cancel: &CancellationToken,
    emitter: &mut TurnEmitter,
    policy: &ToolPolicy,
    messages: &mut Vec<Message>,
) -> RoundOutcome {
    use porter_model::ModelEvent;

    let mut text = String::new();
    let mut had_tool_call = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RoundOutcome::Cancelled,
            ev = stream.next() => ev,
        };

        match event {
            Some(Ok(ModelEvent::TextDelta(delta))) => {
                text.push_str(&delta);
                emitter.emit(TurnEvent::AssistantDelta { text: delta });
            }
            Some(Ok(ModelEvent::ToolCall {
                id,
                name,
                arguments,
            })) => {
                had_tool_call = true;
                emitter.emit(TurnEvent::ToolCallStart {
                    id: id.clone(),
                    name: name.clone(),
                    args: arguments.clone(),
                });

                let result = if !policy.allows(&name) {
                    ToolCallResult::err(format!("tool '{name}' is not permitted for this agent"))
                } else {
                    let call = ToolCallRequest {
                        id: id.clone(),
                        name: name.clone(),
                        args: arguments.clone(),
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return RoundOutcome::Cancelled,
                        r = ctx.tools.dispatch(&input.session_key, &input.run_id, call, emitter) => r,
                    }
                };

                emitter.emit(TurnEvent::ToolCallEnd {
                    id: id.clone(),
                    result: result.output.clone(),
                    is_error: result.is_error,
                });

                messages.push(Message::assistant(format!(
                    "[tool-call {name} id={id}] {arguments}"
                )));
                messages.push(Message::tool_result(id, result.output));
            }
            Some(Ok(ModelEvent::Done)) => break,
            Some(Err(e)) => return RoundOutcome::Failed(e.to_string()),
            None => break,
        }
    }

    if had_tool_call {
        RoundOutcome::ToolRound
    } else {
        RoundOutcome::Final(text)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use porter_config::StateDir;
    use porter_model::{MockProvider, ModelEvent, ScriptedProvider};
    use serde_json::json;
    use std::sync::Mutex;

    fn test_ctx(provider: Arc<dyn ModelProvider>, tools: Arc<dyn ToolDispatcher>) -> (TurnContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TurnContext {
            provider,
            tools,
            transcript: Arc::new(TranscriptLog::new(StateDir::new(dir.path()))),
            agent_name: "default".into(),
            agent: AgentConfig::default(),
        };
        (ctx, dir)
    }

    fn test_input(text: &str) -> TurnInput {
        TurnInput {
            session_key: SessionKey::from_raw("web:default:dm:u1"),
            run_id: "run-1".into(),
            user_text: text.into(),
            system_notes: Vec::new(),
            thinking: None,
        }
    }

    fn emitter_pair() -> (TurnEmitter, broadcast::Receiver<TurnNotice>) {
        let (tx, rx) = broadcast::channel(256);
        let em = TurnEmitter::new(
            tx,
            SessionKey::from_raw("web:default:dm:u1"),
            "default",
            "run-1",
        );
        (em, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<TurnNotice>) -> Vec<TurnNotice> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    /// Records every dispatched call and answers with a fixed result.
    struct RecordingTools {
        calls: Mutex<Vec<ToolCallRequest>>,
        result: ToolCallResult,
    }

    impl RecordingTools {
        fn new(result: ToolCallResult) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                result,
            }
        }
    }

    #[async_trait]
    impl ToolDispatcher for RecordingTools {
        fn specs(&self) -> Vec<ToolSpec> {
            vec![ToolSpec {
                name: "exec".into(),
                description: "run a command".into(),
                parameters: json!({"type": "object"}),
            }]
        }

        async fn dispatch(
            &self,
            _session_key: &SessionKey,
            _run_id: &str,
            call: ToolCallRequest,
            _emitter: &mut TurnEmitter,
        ) -> ToolCallResult {
            self.calls.lock().unwrap().push(call);
            self.result.clone()
        }
    }

    // ── Event ordering ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn plain_turn_emits_gapless_sequence_ending_done() {
        let (ctx, _dir) = test_ctx(Arc::new(MockProvider), Arc::new(NoTools));
        let (mut em, mut rx) = emitter_pair();

        let state = run_turn(&ctx, test_input("hello"), CancellationToken::new(), &mut em).await;
        assert_eq!(state, TurnState::Done);

        let notices = drain(&mut rx);
        for (i, n) in notices.iter().enumerate() {
            assert_eq!(n.seq, (i + 1) as u64, "seq must be 1..N without gaps");
        }
        assert!(matches!(
            notices.first().map(|n| &n.event),
            Some(TurnEvent::Lifecycle {
                kind: LifecycleKind::Started,
                ..
            })
        ));
        assert!(notices.last().unwrap().event.is_terminal());
    }

    #[tokio::test]
    async fn final_text_is_persisted_and_emitted_as_message() {
        let provider = Arc::new(ScriptedProvider::always_text("the answer"));
        let (ctx, _dir) = test_ctx(provider, Arc::new(NoTools));
        let (mut em, mut rx) = emitter_pair();

        run_turn(&ctx, test_input("question"), CancellationToken::new(), &mut em).await;

        let notices = drain(&mut rx);
        assert!(notices.iter().any(
            |n| matches!(&n.event, TurnEvent::AssistantMessage { text } if text == "the answer")
        ));

        let history = ctx
            .transcript
            .tail("default", &SessionKey::from_raw("web:default:dm:u1"), None)
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[1].text, "the answer");
    }

    // ── Tool rounds ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_call_round_trips_through_dispatcher() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1",
            "exec",
            json!({"command": "uname -a"}),
            "Linux it is",
        ));
        let tools = Arc::new(RecordingTools::new(ToolCallResult::ok("Linux test 6.1")));
        let (ctx, _dir) = test_ctx(provider, tools.clone());
        let (mut em, mut rx) = emitter_pair();

        let state = run_turn(&ctx, test_input("what os?"), CancellationToken::new(), &mut em).await;
        assert_eq!(state, TurnState::Done);

        let calls = tools.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "exec");

        let notices = drain(&mut rx);
        let start_idx = notices
            .iter()
            .position(|n| matches!(n.event, TurnEvent::ToolCallStart { .. }))
            .expect("tool start emitted");
        let end_idx = notices
            .iter()
            .position(|n| matches!(n.event, TurnEvent::ToolCallEnd { .. }))
            .expect("tool end emitted");
        assert!(start_idx < end_idx);
    }

    #[tokio::test]
    async fn tool_error_feeds_back_and_turn_still_completes() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1",
            "exec",
            json!({"command": "rm -rf /"}),
            "that failed",
        ));
        let tools = Arc::new(RecordingTools::new(ToolCallResult::err("exec denied")));
        let (ctx, _dir) = test_ctx(provider, tools);
        let (mut em, mut rx) = emitter_pair();

        let state = run_turn(&ctx, test_input("try it"), CancellationToken::new(), &mut em).await;
        assert_eq!(state, TurnState::Done, "tool errors do not fail the turn");

        let notices = drain(&mut rx);
        assert!(notices.iter().any(|n| matches!(
            &n.event,
            TurnEvent::ToolCallEnd { is_error: true, .. }
        )));
    }

    #[tokio::test]
    async fn denied_tool_is_not_dispatched() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1",
            "exec",
            json!({}),
            "ok",
        ));
        let tools = Arc::new(RecordingTools::new(ToolCallResult::ok("should not run")));
        let (mut ctx, _dir) = test_ctx(provider, tools.clone());
        ctx.agent.tools_deny = vec!["exec".to_string()];
        let (mut em, mut rx) = emitter_pair();

        run_turn(&ctx, test_input("go"), CancellationToken::new(), &mut em).await;

        assert!(tools.calls.lock().unwrap().is_empty(), "deny must block dispatch");
        let notices = drain(&mut rx);
        assert!(notices.iter().any(|n| matches!(
            &n.event,
            TurnEvent::ToolCallEnd { is_error: true, result, .. } if result.contains("not permitted")
        )));
    }

    // ── Cancellation & failure ────────────────────────────────────────────────

    #[tokio::test]
    async fn pre_cancelled_token_yields_cancelled_terminal() {
        let (ctx, _dir) = test_ctx(Arc::new(MockProvider), Arc::new(NoTools));
        let (mut em, mut rx) = emitter_pair();
        let token = CancellationToken::new();
        token.cancel();

        let state = run_turn(&ctx, test_input("hello"), token, &mut em).await;
        assert_eq!(state, TurnState::Cancelled);

        let notices = drain(&mut rx);
        assert!(matches!(
            &notices.last().unwrap().event,
            TurnEvent::Lifecycle {
                kind: LifecycleKind::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let provider = Arc::new(porter_model::FlakyProvider::new(2));
        let (ctx, _dir) = test_ctx(provider.clone(), Arc::new(NoTools));
        let (mut em, _rx) = emitter_pair();

        let state = run_turn(&ctx, test_input("retry me"), CancellationToken::new(), &mut em).await;
        assert_eq!(state, TurnState::Done);
        assert_eq!(provider.calls(), 3, "two failures + one success");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_into_failed() {
        let provider = Arc::new(porter_model::FlakyProvider::new(100));
        let (ctx, _dir) = test_ctx(provider, Arc::new(NoTools));
        let (mut em, mut rx) = emitter_pair();

        let state = run_turn(&ctx, test_input("never"), CancellationToken::new(), &mut em).await;
        assert_eq!(state, TurnState::Failed);

        let notices = drain(&mut rx);
        assert!(matches!(
            &notices.last().unwrap().event,
            TurnEvent::Lifecycle {
                kind: LifecycleKind::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        struct FatalProvider;
        #[async_trait]
        impl ModelProvider for FatalProvider {
            fn name(&self) -> &str {
                "fatal"
            }
            async fn stream(
                &self,
                _req: CompletionRequest,
            ) -> Result<ModelStream, porter_model::ModelError> {
                Err(porter_model::ModelError::Fatal("quota exceeded".into()))
            }
        }

        let (ctx, _dir) = test_ctx(Arc::new(FatalProvider), Arc::new(NoTools));
        let (mut em, mut rx) = emitter_pair();
        let state = run_turn(&ctx, test_input("x"), CancellationToken::new(), &mut em).await;
        assert_eq!(state, TurnState::Failed);
        let notices = drain(&mut rx);
        assert!(notices.iter().any(|n| matches!(
            &n.event,
            TurnEvent::Lifecycle { kind: LifecycleKind::Failed, detail: Some(d) } if d.contains("quota")
        )));
    }

    // ── Prompt assembly ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn system_notes_land_in_prompt_prelude() {
        let provider = Arc::new(ScriptedProvider::always_text("ok"));
        let last_request = provider.last_request.clone();
        let (ctx, _dir) = test_ctx(provider, Arc::new(NoTools));
        let (mut em, _rx) = emitter_pair();

        let mut input = test_input("hello");
        input.system_notes = vec!["exec denied: rm -rf /".to_string()];
        run_turn(&ctx, input, CancellationToken::new(), &mut em).await;

        let req = last_request.lock().unwrap().clone().unwrap();
        assert!(req.system.contains("exec denied: rm -rf /"));
    }

    #[tokio::test]
    async fn transcript_head_precedes_new_input() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![ModelEvent::TextDelta("first".into()), ModelEvent::Done],
            vec![ModelEvent::TextDelta("second".into()), ModelEvent::Done],
        ]));
        let last_request = provider.last_request.clone();
        let (ctx, _dir) = test_ctx(provider, Arc::new(NoTools));

        let (mut em1, _rx1) = emitter_pair();
        run_turn(&ctx, test_input("turn one"), CancellationToken::new(), &mut em1).await;

        let (mut em2, _rx2) = emitter_pair();
        run_turn(&ctx, test_input("turn two"), CancellationToken::new(), &mut em2).await;

        let req = last_request.lock().unwrap().clone().unwrap();
        let texts: Vec<&str> = req.messages.iter().map(|m| m.content.as_str()).collect();
        let one = texts.iter().position(|t| *t == "turn one").unwrap();
        let first = texts.iter().position(|t| *t == "first").unwrap();
        let two = texts.iter().position(|t| *t == "turn two").unwrap();
        assert!(one < two && first < two, "history must precede the new input");
    }

    // ── ToolPolicy ────────────────────────────────────────────────────────────

    #[test]
    fn policy_deny_wins_over_allow() {
        let mut agent = AgentConfig::default();
        agent.tools_allow = vec!["*".to_string()];
        agent.tools_deny = vec!["exec".to_string()];
        let p = ToolPolicy::from_agent(&agent);
        assert!(!p.allows("exec"));
        assert!(p.allows("read_file"));
    }

    #[test]
    fn policy_default_allows_everything() {
        let p = ToolPolicy::from_agent(&AgentConfig::default());
        assert!(p.allows("anything"));
    }

    #[test]
    fn policy_empty_allow_denies_everything() {
        let mut agent = AgentConfig::default();
        agent.tools_allow = Vec::new();
        let p = ToolPolicy::from_agent(&agent);
        assert!(!p.allows("exec"));
    }

    #[test]
    fn wildcard_tools_allow_does_not_grant_subagents() {
        let p = ToolPolicy::from_agent(&AgentConfig::default());
        assert!(p.allows("exec"));
        assert!(!p.allows("subagent.spawn"), "subagents are a separate family");
    }

    #[test]
    fn subagents_allow_grants_only_listed_agents() {
        let mut agent = AgentConfig::default();
        agent.subagents_allow = vec!["research-*".to_string()];
        let p = ToolPolicy::from_agent(&agent);
        assert!(p.allows("subagent.research-web"));
        assert!(!p.allows("subagent.ops"));
    }
}
