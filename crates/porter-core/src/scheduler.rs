// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Turn scheduler — one FIFO queue and one worker task per session.
//!
//! ```text
//!  chat.send ──► submit ──┐
//!  channel inbound ──────►├─► session worker ──► run_turn ──► TurnNotice
//!  forced flush ─────────►┘      (per key)          │          broadcast
//!                                 owns:             │
//!                                 - turn queue      └─► transcript JSONL
//!                                 - debounce timer
//! ```
//!
//! The worker enforces the scheduling contract: at most one running turn
//! per session, turns totally ordered per session, events for turn *k+1*
//! never preceding the terminal event of turn *k*. While a turn is active
//! the worker keeps draining its command channel — new inbound keeps
//! debouncing and queueing behind the active turn instead of backing up
//! the senders.
//!
//! Back-pressure: the queue is bounded; overflow merges the new input into
//! the last queued entry instead of dropping it. Idle workers evict
//! themselves after the configured TTL — the session itself survives (its
//! transcript and registry entry are durable), only the worker goes away.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use porter_config::{AgentConfig, Config};
use porter_model::ModelProvider;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::debounce::{Debouncer, InboundMessage};
use crate::driver::{run_turn, NoTools, ToolDispatcher, TurnContext, TurnEmitter, TurnInput};
use crate::events::{LifecycleKind, SystemEventRing, TurnEvent, TurnNotice};
use crate::session::{SessionStore, TranscriptLog};
use crate::session_key::SessionKey;

/// Why a run was cancelled. Logged and audited; the wire sees a plain
/// `{lifecycle: cancelled}` either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    Timeout,
    Disconnect,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled"),
            CancelReason::Timeout => write!(f, "timeout"),
            CancelReason::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// Retry-window cache size for `chat.send` idempotency keys.
const IDEMPOTENCY_CACHE: usize = 256;

struct QueuedTurn {
    run_id: String,
    text: String,
    thinking: Option<bool>,
    token: CancellationToken,
}

enum SessionCmd {
    /// A `chat.send`: enqueue immediately, bypassing the debouncer.
    Direct {
        run_id: String,
        text: String,
        thinking: Option<bool>,
    },
    /// A channel inbound: goes through the debounce window.
    Inbound { text: String, at: DateTime<Utc> },
    /// Force-flush the debounce buffer now.
    Flush,
}

struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCmd>,
}

struct SchedulerInner {
    config: std::sync::RwLock<Arc<Config>>,
    provider: Arc<dyn ModelProvider>,
    /// Installed after construction (the tool surface needs a handle back
    /// to the scheduler for system events).
    tools: std::sync::RwLock<Arc<dyn ToolDispatcher>>,
    transcript: Arc<TranscriptLog>,
    store: Arc<SessionStore>,
    notices: broadcast::Sender<TurnNotice>,
    sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
    runs: Mutex<HashMap<String, CancellationToken>>,
    system_events: std::sync::Mutex<HashMap<SessionKey, SystemEventRing>>,
    idempotency: std::sync::Mutex<LruCache<String, String>>,
}

/// Handle to the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        provider: Arc<dyn ModelProvider>,
        transcript: Arc<TranscriptLog>,
        store: Arc<SessionStore>,
    ) -> Self {
        let (notices, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(SchedulerInner {
                config: std::sync::RwLock::new(config),
                provider,
                tools: std::sync::RwLock::new(Arc::new(NoTools)),
                transcript,
                store,
                notices,
                sessions: Mutex::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
                system_events: std::sync::Mutex::new(HashMap::new()),
                idempotency: std::sync::Mutex::new(LruCache::new(
                    NonZeroUsize::new(IDEMPOTENCY_CACHE).expect("cache size > 0"),
                )),
            }),
        }
    }

    /// Install the tool surface. Called once during gateway assembly,
    /// before any turn runs.
    pub fn set_tools(&self, tools: Arc<dyn ToolDispatcher>) {
        *self.inner.tools.write().unwrap() = tools;
    }

    /// Swap the config for *new* sessions. Live workers keep the snapshot
    /// they were spawned with until they idle out.
    pub fn update_config(&self, config: Arc<Config>) {
        *self.inner.config.write().unwrap() = config;
    }

    /// Subscribe to the sequenced turn-event stream of all sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnNotice> {
        self.inner.notices.subscribe()
    }

    /// Schedule a turn directly (the `chat.send` path). Returns the run id
    /// without waiting for the turn.
    ///
    /// Repeated submissions with the same idempotency key inside the retry
    /// window return the original run id and schedule nothing.
    pub async fn submit(
        &self,
        key: &SessionKey,
        agent: &str,
        text: impl Into<String>,
        thinking: Option<bool>,
        idempotency_key: Option<&str>,
    ) -> String {
        if let Some(idem) = idempotency_key {
            if let Some(existing) = self.inner.idempotency.lock().unwrap().get(idem) {
                debug!(%key, idem, "duplicate chat.send suppressed");
                return existing.clone();
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        self.inner.runs.lock().await.insert(run_id.clone(), token);
        if let Some(idem) = idempotency_key {
            self.inner
                .idempotency
                .lock()
                .unwrap()
                .put(idem.to_string(), run_id.clone());
        }

        self.inner.store.ensure(key, agent).await;
        self.send_cmd(
            key,
            agent,
            SessionCmd::Direct {
                run_id: run_id.clone(),
                text: text.into(),
                thinking,
            },
        )
        .await;
        run_id
    }

    /// Feed a channel inbound message through the session's debouncer.
    pub async fn inbound(&self, key: &SessionKey, agent: &str, text: impl Into<String>) {
        self.inner.store.ensure(key, agent).await;
        self.send_cmd(
            key,
            agent,
            SessionCmd::Inbound {
                text: text.into(),
                at: Utc::now(),
            },
        )
        .await;
    }

    /// Force the session's debounce buffer to flush now.
    pub async fn flush(&self, key: &SessionKey, agent: &str) {
        self.send_cmd(key, agent, SessionCmd::Flush).await;
    }

    /// Append an assistant note to the transcript without running a turn
    /// (`chat.inject`).
    pub async fn inject(&self, key: &SessionKey, agent: &str, text: &str) -> anyhow::Result<()> {
        self.inner.store.ensure(key, agent).await;
        self.inner.transcript.append(agent, key, "assistant", text)
    }

    /// Queue a note for the session's next turn prompt.
    pub fn push_system_event(&self, key: &SessionKey, note: impl Into<String>) {
        let capacity = self.inner.config.read().unwrap().session.system_event_ring;
        let mut rings = self.inner.system_events.lock().unwrap();
        rings
            .entry(key.clone())
            .or_insert_with(|| SystemEventRing::new(capacity))
            .push(note);
    }

    /// Cooperatively cancel a run (queued or active). Returns whether the
    /// run was known.
    pub async fn cancel(&self, run_id: &str, reason: CancelReason) -> bool {
        let runs = self.inner.runs.lock().await;
        match runs.get(run_id) {
            Some(token) => {
                info!(run_id, %reason, "cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live session workers (observability + tests).
    pub async fn active_workers(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// The session registry this scheduler records sessions in.
    pub fn store(&self) -> Arc<SessionStore> {
        self.inner.store.clone()
    }

    /// The transcript log turns persist to.
    pub fn transcript(&self) -> Arc<TranscriptLog> {
        self.inner.transcript.clone()
    }

    // ── Worker plumbing ───────────────────────────────────────────────────────

    async fn send_cmd(&self, key: &SessionKey, agent: &str, mut cmd: SessionCmd) {
        loop {
            let tx = self.get_or_spawn(key, agent).await;
            match tx.send(cmd).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // Worker evicted between lookup and send; drop the stale
                    // handle and respawn.
                    cmd = returned;
                    let mut sessions = self.inner.sessions.lock().await;
                    if let Some(handle) = sessions.get(key) {
                        if handle.cmd_tx.is_closed() {
                            sessions.remove(key);
                        }
                    }
                }
            }
        }
    }

    async fn get_or_spawn(&self, key: &SessionKey, agent: &str) -> mpsc::Sender<SessionCmd> {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(handle) = sessions.get(key) {
            if !handle.cmd_tx.is_closed() {
                return handle.cmd_tx.clone();
            }
            sessions.remove(key);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        sessions.insert(
            key.clone(),
            SessionHandle {
                cmd_tx: cmd_tx.clone(),
            },
        );
        tokio::spawn(session_worker(
            self.inner.clone(),
            key.clone(),
            agent.to_string(),
            cmd_rx,
            cmd_tx.clone(),
        ));
        debug!(%key, agent, "session worker spawned");
        cmd_tx
    }
}

impl SchedulerInner {
    fn take_system_events(&self, key: &SessionKey) -> Vec<String> {
        let mut rings = self.system_events.lock().unwrap();
        rings.get_mut(key).map(|r| r.drain()).unwrap_or_default()
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn session_worker(
    inner: Arc<SchedulerInner>,
    key: SessionKey,
    agent_name: String,
    mut cmd_rx: mpsc::Receiver<SessionCmd>,
    own_tx: mpsc::Sender<SessionCmd>,
) {
    // Config is snapshotted at spawn: a reload never re-keys or re-tunes a
    // live session, only workers spawned afterwards see the new values.
    let config = inner.config.read().unwrap().clone();
    let channel = key.as_str().split(':').next().unwrap_or("").to_string();
    let window = Duration::from_millis(config.channel(&channel).debounce_ms);
    let queue_bound = config.session.queue_bound.max(1);
    let idle_ttl = Duration::from_secs(config.session.idle_ttl_secs.max(1));
    let agent_cfg = config.agent(&agent_name);

    let mut debouncer = Debouncer::new(window);
    let mut queue: VecDeque<QueuedTurn> = VecDeque::new();
    let mut channel_closed = false;

    'main: loop {
        // ── Active phase: run queued turns, one at a time ─────────────────────
        while let Some(turn) = queue.pop_front() {
            if turn.token.is_cancelled() {
                let mut emitter = TurnEmitter::new(
                    inner.notices.clone(),
                    key.clone(),
                    agent_name.clone(),
                    turn.run_id.clone(),
                );
                emitter.emit(TurnEvent::Lifecycle {
                    kind: LifecycleKind::Cancelled,
                    detail: Some("cancelled while queued".into()),
                });
                inner.runs.lock().await.remove(&turn.run_id);
                continue;
            }

            let run_id = turn.run_id.clone();
            let fut = execute_turn(
                inner.clone(),
                key.clone(),
                agent_name.clone(),
                agent_cfg.clone(),
                turn,
            );
            tokio::pin!(fut);

            // Keep accepting commands while the turn runs: later inbound
            // debounces and queues behind it; nothing backs up the senders.
            loop {
                let deadline = debouncer.deadline();
                tokio::select! {
                    _ = &mut fut => break,
                    cmd = cmd_rx.recv(), if !channel_closed => {
                        match cmd {
                            None => channel_closed = true,
                            Some(cmd) => {
                                handle_cmd(&inner, &mut queue, &mut debouncer, queue_bound, cmd)
                                    .await;
                            }
                        }
                    }
                    _ = sleep_deadline(deadline), if deadline.is_some() => {
                        flush_into_queue(&inner, &mut debouncer, &mut queue, queue_bound).await;
                    }
                }
            }
            inner.runs.lock().await.remove(&run_id);
        }

        if channel_closed {
            break 'main;
        }

        // ── Idle phase: wait for work, a debounce flush, or eviction ─────────
        let deadline = debouncer.deadline();
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => break 'main,
                    Some(cmd) => {
                        handle_cmd(&inner, &mut queue, &mut debouncer, queue_bound, cmd).await;
                    }
                }
            }
            _ = sleep_deadline(deadline), if deadline.is_some() => {
                flush_into_queue(&inner, &mut debouncer, &mut queue, queue_bound).await;
            }
            _ = tokio::time::sleep(idle_ttl), if queue.is_empty() && debouncer.is_empty() => {
                // Idle eviction: the worker goes away, the session's durable
                // state stays. A later message respawns the worker.
                break 'main;
            }
        }
    }

    let mut sessions = inner.sessions.lock().await;
    if let Some(handle) = sessions.get(&key) {
        if handle.cmd_tx.same_channel(&own_tx) {
            sessions.remove(&key);
        }
    }
    debug!(%key, "session worker evicted");
}

async fn execute_turn(
    inner: Arc<SchedulerInner>,
    key: SessionKey,
    agent_name: String,
    agent_cfg: AgentConfig,
    turn: QueuedTurn,
) {
    let mut emitter = TurnEmitter::new(
        inner.notices.clone(),
        key.clone(),
        agent_name.clone(),
        turn.run_id.clone(),
    );
    let system_notes = inner.take_system_events(&key);
    let ctx = TurnContext {
        provider: inner.provider.clone(),
        tools: inner.tools.read().unwrap().clone(),
        transcript: inner.transcript.clone(),
        agent_name,
        agent: agent_cfg,
    };
    let input = TurnInput {
        session_key: key,
        run_id: turn.run_id,
        user_text: turn.text,
        system_notes,
        thinking: turn.thinking,
    };
    let _ = run_turn(&ctx, input, turn.token, &mut emitter).await;
}

async fn handle_cmd(
    inner: &Arc<SchedulerInner>,
    queue: &mut VecDeque<QueuedTurn>,
    debouncer: &mut Debouncer,
    bound: usize,
    cmd: SessionCmd,
) {
    match cmd {
        SessionCmd::Direct {
            run_id,
            text,
            thinking,
        } => {
            let token = inner
                .runs
                .lock()
                .await
                .get(&run_id)
                .cloned()
                .unwrap_or_default();
            enqueue(
                inner,
                queue,
                bound,
                QueuedTurn {
                    run_id,
                    text,
                    thinking,
                    token,
                },
            )
            .await;
        }
        SessionCmd::Inbound { text, at } => {
            debouncer.push(InboundMessage { text, at });
        }
        SessionCmd::Flush => {
            flush_into_queue(inner, debouncer, queue, bound).await;
        }
    }
}

/// Enqueue with the bounded-queue contract: overflow merges into the last
/// queued entry rather than dropping, and the merged run id becomes an
/// alias for the surviving entry's cancellation token.
async fn enqueue(
    inner: &Arc<SchedulerInner>,
    queue: &mut VecDeque<QueuedTurn>,
    bound: usize,
    turn: QueuedTurn,
) {
    if queue.len() >= bound {
        if let Some(last) = queue.back_mut() {
            warn!(run_id = %turn.run_id, into = %last.run_id, "turn queue full, merging input");
            last.text.push_str("\n\n");
            last.text.push_str(&turn.text);
            inner
                .runs
                .lock()
                .await
                .insert(turn.run_id, last.token.clone());
            return;
        }
    }
    queue.push_back(turn);
}

async fn flush_into_queue(
    inner: &Arc<SchedulerInner>,
    debouncer: &mut Debouncer,
    queue: &mut VecDeque<QueuedTurn>,
    bound: usize,
) {
    let Some(flushed) = debouncer.flush() else {
        return;
    };
    let run_id = Uuid::new_v4().to_string();
    let token = CancellationToken::new();
    inner.runs.lock().await.insert(run_id.clone(), token.clone());
    enqueue(
        inner,
        queue,
        bound,
        QueuedTurn {
            run_id,
            text: flushed.composite_text(),
            thinking: None,
            token,
        },
    )
    .await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
