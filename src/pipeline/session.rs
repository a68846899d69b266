//! Per-participant session state
//!
//! One [`Session`] per remote participant: the rolling audio buffer, the
//! bounded queue of finalized responses awaiting synthesis, the rolling
//! conversation history, counters, and the cancellation handles for
//! whatever LLM/TTS work is currently in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::metrics::{CounterTotals, SessionMetrics};
use crate::pipeline::audio::RollingBuffer;
use crate::pipeline::CancelToken;
use crate::transport::{EventPublisher, MediaTransport};

/// Approximate token count: 4 characters ≈ 1 token.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Rolling list of conversation turns, pruned FIFO to a token budget.
#[derive(Debug)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    max_tokens: usize,
}

impl ConversationHistory {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_tokens,
        }
    }

    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.turns.push_back(ConversationTurn {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        });
        self.prune();
    }

    fn prune(&mut self) {
        // Keep at least the newest turn even if it alone blows the budget.
        while self.turns.len() > 1 && self.total_tokens() > self.max_tokens {
            self.turns.pop_front();
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.turns.iter().map(|t| approx_tokens(&t.text)).sum()
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }
}

/// Per-session event counters, updated from any stage task.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub asr_chunks: AtomicU64,
    pub llm_tokens: AtomicU64,
    pub tts_frames: AtomicU64,
    pub barge_ins: AtomicU64,
    pub errors: AtomicU64,
}

impl SessionCounters {
    pub fn totals(&self) -> CounterTotals {
        CounterTotals {
            asr_chunks: self.asr_chunks.load(Ordering::Relaxed),
            llm_tokens: self.llm_tokens.load(Ordering::Relaxed),
            tts_frames: self.tts_frames.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a bounded-queue push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue stayed full past the deadline; the text was discarded.
    Dropped,
}

/// Bounded FIFO of finalized response texts awaiting synthesis.
///
/// Producers block up to a deadline when the queue is full, then drop.
/// Barge-in and session teardown flush it unconditionally via [`clear`].
///
/// [`clear`]: TtsQueue::clear
pub struct TtsQueue {
    inner: Mutex<VecDeque<String>>,
    capacity: usize,
    /// Signalled when an item is pushed.
    item_ready: Notify,
    /// Signalled when space frees up.
    space_ready: Notify,
}

impl TtsQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn try_push(&self, text: &str) -> bool {
        let mut queue = self.inner.lock().expect("tts queue poisoned");
        if queue.len() < self.capacity {
            queue.push_back(text.to_string());
            true
        } else {
            false
        }
    }

    /// Push with a blocking deadline; on timeout the text is dropped and the
    /// caller is told so it can log.
    pub async fn push(&self, text: String, deadline: Duration) -> PushOutcome {
        if self.try_push(&text) {
            self.item_ready.notify_one();
            return PushOutcome::Queued;
        }

        let timeout_at = tokio::time::Instant::now() + deadline;
        loop {
            let space = self.space_ready.notified();
            // Re-check after arming the waiter so a concurrent pop cannot
            // slip between the check and the wait.
            if self.try_push(&text) {
                self.item_ready.notify_one();
                return PushOutcome::Queued;
            }
            if tokio::time::timeout_at(timeout_at, space).await.is_err() {
                return PushOutcome::Dropped;
            }
        }
    }

    /// Wait for the next item. Intended to be raced against a cancel token
    /// inside `tokio::select!`.
    pub async fn pop(&self) -> String {
        loop {
            let item = self.item_ready.notified();
            if let Some(text) = self.inner.lock().expect("tts queue poisoned").pop_front() {
                self.space_ready.notify_one();
                return text;
            }
            item.await;
        }
    }

    /// Drop everything queued. Returns how many entries were flushed.
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock().expect("tts queue poisoned");
        let flushed = queue.len();
        queue.clear();
        drop(queue);
        if flushed > 0 {
            self.space_ready.notify_one();
        }
        flushed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("tts queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handles for the background tasks a session owns. All of them must be
/// cancelled and joined (or abandoned after the grace period) before the
/// session is reclaimed.
#[derive(Default)]
pub struct SessionTasks {
    pub ingress: Option<JoinHandle<()>>,
    pub asr: Option<JoinHandle<()>>,
    pub dispatcher: Option<JoinHandle<()>>,
    pub pump: Option<JoinHandle<()>>,
    pub tts: Option<JoinHandle<()>>,
    pub llm: Option<JoinHandle<()>>,
}

impl SessionTasks {
    /// Drain every handle for teardown, in stop order.
    pub fn drain(&mut self) -> Vec<JoinHandle<()>> {
        [
            self.ingress.take(),
            self.asr.take(),
            self.llm.take(),
            self.tts.take(),
            self.dispatcher.take(),
            self.pump.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// All state for one participant ↔ agent conversation.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub buffer: Arc<RollingBuffer>,
    pub publisher: EventPublisher,
    pub transport: Arc<dyn MediaTransport>,
    pub counters: SessionCounters,
    pub history: Mutex<ConversationHistory>,
    pub tts_queue: Arc<TtsQueue>,
    pub metrics: Arc<SessionMetrics>,

    pub is_agent_speaking: AtomicBool,
    pub is_active: AtomicBool,

    /// Covers ingress + ASR; cancelled once, at teardown.
    pub cancel: CancelToken,
    /// Replaced per LLM request.
    pub llm_cancel: Mutex<Option<CancelToken>>,
    /// Replaced per TTS-consumer incarnation (barge-in restarts it).
    pub tts_cancel: Mutex<CancelToken>,
    pub tasks: Mutex<SessionTasks>,

    /// Monotonic timestamp of the most recent ASR final, for end-to-end
    /// latency accounting.
    pub last_asr_final: Mutex<Option<Instant>>,
    /// Most recent inbound audio, for the inactivity sweeper.
    pub last_audio: Mutex<Instant>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn MediaTransport>,
        buffer_samples: usize,
        queue_capacity: usize,
        history_tokens: usize,
    ) -> Self {
        let id = id.into();
        Self {
            created_at: Utc::now(),
            buffer: Arc::new(RollingBuffer::new(buffer_samples)),
            publisher: EventPublisher::new(id.clone(), transport.clone()),
            transport,
            counters: SessionCounters::default(),
            history: Mutex::new(ConversationHistory::new(history_tokens)),
            tts_queue: Arc::new(TtsQueue::new(queue_capacity)),
            metrics: Arc::new(SessionMetrics::new(id.clone())),
            is_agent_speaking: AtomicBool::new(false),
            is_active: AtomicBool::new(false),
            cancel: CancelToken::new(),
            llm_cancel: Mutex::new(None),
            tts_cancel: Mutex::new(CancelToken::new()),
            tasks: Mutex::new(SessionTasks::default()),
            last_asr_final: Mutex::new(None),
            last_audio: Mutex::new(Instant::now()),
            id,
        }
    }

    /// Called on every inbound audio frame; first audio activates the session.
    pub fn touch_audio(&self) {
        *self.last_audio.lock().expect("session clock poisoned") = Instant::now();
        self.is_active.store(true, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_audio
            .lock()
            .expect("session clock poisoned")
            .elapsed()
    }

    pub fn mark_asr_final(&self) {
        *self.last_asr_final.lock().expect("session clock poisoned") = Some(Instant::now());
    }

    pub fn since_last_asr_final(&self) -> Option<Duration> {
        self.last_asr_final
            .lock()
            .expect("session clock poisoned")
            .map(|t| t.elapsed())
    }

    /// Cancel whatever LLM request is in flight, if any. The task observes
    /// its token at the next suspension point; its handle stays in `tasks`
    /// so teardown can await it.
    pub fn cancel_llm(&self) {
        if let Some(token) = self
            .llm_cancel
            .lock()
            .expect("llm cancel poisoned")
            .take()
        {
            token.cancel();
        }
    }

    /// Commit a user/agent turn pair-wise as stages complete.
    pub fn commit_turn(&self, role: Role, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.history
            .lock()
            .expect("history poisoned")
            .push(role, text.trim());
    }

    /// Flush the TTS queue, logging when anything was discarded.
    pub fn flush_tts_queue(&self) {
        let flushed = self.tts_queue.clear();
        if flushed > 0 {
            warn!(session = %self.id, flushed, "Flushed pending TTS responses");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }

    #[test]
    fn test_history_prunes_fifo() {
        // Budget of 4 tokens = 16 chars.
        let mut history = ConversationHistory::new(4);
        history.push(Role::User, "first turn text!");
        history.push(Role::Agent, "second turn body");
        // Oldest turn pruned to fit.
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().role, Role::Agent);
    }

    #[test]
    fn test_history_keeps_oversized_newest_turn() {
        let mut history = ConversationHistory::new(1);
        history.push(Role::User, "a very long turn that alone exceeds the budget");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_push_pop_order() {
        let queue = TtsQueue::new(4);
        assert_eq!(
            queue.push("one".into(), Duration::from_millis(10)).await,
            PushOutcome::Queued
        );
        assert_eq!(
            queue.push("two".into(), Duration::from_millis(10)).await,
            PushOutcome::Queued
        );
        assert_eq!(queue.pop().await, "one");
        assert_eq!(queue.pop().await, "two");
    }

    #[tokio::test]
    async fn test_queue_full_drops_after_deadline() {
        let queue = TtsQueue::new(1);
        queue.push("held".into(), Duration::from_millis(10)).await;

        let start = Instant::now();
        let outcome = queue
            .push("overflow".into(), Duration::from_millis(60))
            .await;
        assert_eq!(outcome, PushOutcome::Dropped);
        assert!(start.elapsed() >= Duration::from_millis(55));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_blocked_push_resumes_on_pop() {
        let queue = Arc::new(TtsQueue::new(1));
        queue.push("held".into(), Duration::from_millis(10)).await;

        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push("second".into(), Duration::from_millis(500)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pop().await, "held");
        assert_eq!(pusher.await.unwrap(), PushOutcome::Queued);
        assert_eq!(queue.pop().await, "second");
    }

    #[tokio::test]
    async fn test_queue_clear() {
        let queue = TtsQueue::new(4);
        queue.push("a".into(), Duration::from_millis(10)).await;
        queue.push("b".into(), Duration::from_millis(10)).await;
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_counters_totals() {
        let counters = SessionCounters::default();
        counters.asr_chunks.fetch_add(3, Ordering::Relaxed);
        counters.barge_ins.fetch_add(1, Ordering::Relaxed);
        let totals = counters.totals();
        assert_eq!(totals.asr_chunks, 3);
        assert_eq!(totals.barge_ins, 1);
        assert_eq!(totals.errors, 0);
    }
}
