//! Pipeline coordinator
//!
//! Owns the session registry and wires the stages together:
//!
//! ```text
//! transport frames → AudioIngress → RollingBuffer → AsrWindower
//!                                                       │ partial/final
//!                                                       ▼
//!                         outbound pump ◄── event dispatcher ──► LLM task
//!                               │                                   │ final
//!                               ▼                                   ▼
//!                           datagrams                           tts_queue → TtsConsumer
//! ```
//!
//! Barge-in cancels the in-flight LLM request and the TTS consumer (bounded
//! grace), flushes the queue, notifies the client, and restarts a fresh
//! consumer for subsequent responses.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::metrics::MetricsManager;
use crate::pipeline::asr::{AsrEvent, AsrWindower, SttClient};
use crate::pipeline::audio::AudioIngress;
use crate::pipeline::llm::{build_messages, LlmClient};
use crate::pipeline::session::{PushOutcome, Role, Session};
use crate::pipeline::tts::{TtsClient, TtsConsumer};
use crate::pipeline::CancelToken;
use crate::transport::{ClientEvent, MediaTransport, PcmFrame, ServerEvent};

const OUTBOUND_CAPACITY: usize = 64;
const AUDIO_CAPACITY: usize = 32;
const ASR_EVENT_CAPACITY: usize = 16;

/// How long teardown waits for each task before aborting it.
const TEARDOWN_GRACE: Duration = Duration::from_millis(500);

/// Synchronous failures callers must handle at the coordinator boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session quota exceeded ({limit} concurrent sessions)")]
    QuotaExceeded { limit: usize },
    #[error("session already exists for participant: {0}")]
    SessionExists(String),
    #[error("unknown session: {0}")]
    SessionNotFound(String),
}

/// The seam handed to the transport layer for one session: where to push
/// decoded audio frames.
pub struct SessionHandle {
    session: Arc<Session>,
    audio_tx: mpsc::Sender<PcmFrame>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session.id)
            .finish()
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Forward one decoded frame into the pipeline. Returns `false` once the
    /// session has shut down (frames are then silently discarded).
    pub async fn push_frame(&self, frame: PcmFrame) -> bool {
        self.session.touch_audio();
        self.audio_tx.send(frame).await.is_ok()
    }
}

struct SessionEntry {
    session: Arc<Session>,
    outbound_tx: mpsc::Sender<ServerEvent>,
    _audio_tx: mpsc::Sender<PcmFrame>,
}

/// Owns every live session and the shared stage clients.
pub struct PipelineCoordinator {
    config: Config,
    stt: Arc<SttClient>,
    llm: Arc<LlmClient>,
    tts: Arc<TtsClient>,
    metrics: Arc<MetricsManager>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl PipelineCoordinator {
    pub fn new(config: Config, metrics: Arc<MetricsManager>) -> Self {
        let stt = Arc::new(SttClient::new(config.asr.clone()));
        let llm = Arc::new(LlmClient::new(config.llm.clone()));
        let tts = Arc::new(TtsClient::new(config.tts.clone()));
        Self {
            config,
            stt,
            llm,
            tts,
            metrics,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    /// Stable session id for a participant identity.
    pub fn session_id_for(participant: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, participant.as_bytes()).to_string()
    }

    /// Create a session for a joining participant and start its tasks.
    ///
    /// Fails synchronously (no partial state, no tasks) when the concurrent
    /// session quota is reached or the participant already has a session.
    pub async fn create_session(
        &self,
        participant: &str,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<SessionHandle, PipelineError> {
        let session_id = Self::session_id_for(participant);
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.config.session.max_concurrent_sessions {
            warn!(
                participant,
                limit = self.config.session.max_concurrent_sessions,
                "Rejecting session: quota exceeded"
            );
            return Err(PipelineError::QuotaExceeded {
                limit: self.config.session.max_concurrent_sessions,
            });
        }
        if sessions.contains_key(&session_id) {
            return Err(PipelineError::SessionExists(participant.to_string()));
        }

        let cfg = &self.config.session;
        let buffer_samples =
            (cfg.buffer_ms * crate::pipeline::audio::TARGET_SAMPLE_RATE as u64 / 1000) as usize;
        let session = Arc::new(Session::new(
            session_id.clone(),
            transport,
            buffer_samples,
            cfg.tts_queue_capacity,
            cfg.memory_context_tokens,
        ));

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel::<PcmFrame>(AUDIO_CAPACITY);
        let (asr_tx, asr_rx) = mpsc::channel::<AsrEvent>(ASR_EVENT_CAPACITY);

        // Outbound pump: the single writer toward the transport's datagram
        // channels, so reliable events keep their publish order.
        let publisher = session.publisher.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                publisher.publish(event).await;
            }
        });

        let ingress = Arc::new(AudioIngress::new(
            session.buffer.clone(),
            cfg.ingress_log_every,
        ));
        let ingress_task = tokio::spawn(ingress.run(audio_rx, session.cancel.clone()));

        let windower = AsrWindower::new(
            session.buffer.clone(),
            self.stt.clone(),
            self.config.asr.clone(),
            asr_tx,
            session.metrics.clone(),
        );
        let asr_task = tokio::spawn(windower.run(session.cancel.clone()));

        let dispatcher = tokio::spawn(Self::dispatch_events(
            asr_rx,
            session.clone(),
            self.llm.clone(),
            outbound_tx.clone(),
            Duration::from_millis(cfg.queue_push_deadline_ms),
        ));

        let tts_token = CancelToken::new();
        *session.tts_cancel.lock().expect("tts cancel poisoned") = tts_token.clone();
        let consumer = TtsConsumer::new(
            session.clone(),
            self.tts.clone(),
            self.config.tts.clone(),
            outbound_tx.clone(),
        );
        let tts_task = tokio::spawn(consumer.run(tts_token));

        {
            let mut tasks = session.tasks.lock().expect("tasks poisoned");
            tasks.pump = Some(pump);
            tasks.ingress = Some(ingress_task);
            tasks.asr = Some(asr_task);
            tasks.dispatcher = Some(dispatcher);
            tasks.tts = Some(tts_task);
        }

        sessions.insert(
            session_id.clone(),
            SessionEntry {
                session: session.clone(),
                outbound_tx,
                _audio_tx: audio_tx.clone(),
            },
        );
        info!(participant, session = %session_id, "Session created");

        Ok(SessionHandle { session, audio_tx })
    }

    /// Single consumer of a session's transcript events; keeps publish order
    /// and drives the LLM stage.
    async fn dispatch_events(
        mut events: mpsc::Receiver<AsrEvent>,
        session: Arc<Session>,
        llm: Arc<LlmClient>,
        outbound: mpsc::Sender<ServerEvent>,
        queue_deadline: Duration,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                AsrEvent::Partial { text, chunk_index } => {
                    session.counters.asr_chunks.fetch_add(1, Ordering::Relaxed);
                    debug!(session = %session.id, chunk_index, "asr_partial: \"{}\"", text);
                    if outbound.send(ServerEvent::AsrPartial { text }).await.is_err() {
                        break;
                    }
                }
                AsrEvent::Final { text } => {
                    session.mark_asr_final();
                    info!(session = %session.id, "asr_final: \"{}\"", text);
                    if outbound
                        .send(ServerEvent::AsrFinal { text: text.clone() })
                        .await
                        .is_err()
                    {
                        break;
                    }

                    // Empty finals never reach the LLM; neither does a final
                    // flushed during teardown.
                    if text.trim().is_empty() || session.cancel.is_cancelled() {
                        continue;
                    }
                    session.cancel_llm();
                    Self::launch_llm(
                        session.clone(),
                        llm.clone(),
                        outbound.clone(),
                        queue_deadline,
                        text,
                    );
                }
                AsrEvent::Error => {
                    session.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        debug!(session = %session.id, "Event dispatcher stopped");
    }

    /// Spawn the per-request LLM task. Its cancel token is registered on the
    /// session before the task starts so barge-in can always reach it.
    fn launch_llm(
        session: Arc<Session>,
        llm: Arc<LlmClient>,
        outbound: mpsc::Sender<ServerEvent>,
        queue_deadline: Duration,
        user_text: String,
    ) {
        let token = CancelToken::new();
        *session.llm_cancel.lock().expect("llm cancel poisoned") = Some(token.clone());

        let task_session = session.clone();
        let handle = tokio::spawn(async move {
            let messages = {
                let history = task_session.history.lock().expect("history poisoned");
                build_messages(&history, &user_text)
            };

            let started = Instant::now();
            let partial_tx = outbound.clone();
            let result = llm
                .stream_chat(messages, &token, move |partial| {
                    // Backpressure on the datagram pump must not stall the
                    // stream; a skipped partial is superseded by the next.
                    let _ = partial_tx.try_send(ServerEvent::LlmPartial {
                        text: partial.to_string(),
                    });
                })
                .await;

            match result {
                Ok(Some(response)) => {
                    task_session
                        .metrics
                        .record_llm_latency(started.elapsed().as_millis() as f64);
                    task_session
                        .counters
                        .llm_tokens
                        .fetch_add(response.token_count, Ordering::Relaxed);
                    let _ = outbound
                        .send(ServerEvent::LlmFinal {
                            text: response.text.clone(),
                        })
                        .await;

                    if response.text.trim().is_empty() {
                        debug!(session = %task_session.id, "Empty LLM response; nothing to commit");
                        return;
                    }
                    task_session.commit_turn(Role::User, &user_text);
                    task_session.commit_turn(Role::Agent, &response.text);

                    if task_session
                        .tts_queue
                        .push(response.text, queue_deadline)
                        .await
                        == PushOutcome::Dropped
                    {
                        warn!(session = %task_session.id, "TTS queue full; response dropped");
                        task_session.counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(None) => {
                    debug!(session = %task_session.id, "LLM request cancelled");
                }
                Err(e) => {
                    error!(session = %task_session.id, "LLM request failed: {:#}", e);
                    task_session.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        session.tasks.lock().expect("tasks poisoned").llm = Some(handle);
    }

    /// Entry point for inbound reliable datagrams from the client.
    pub async fn handle_client_datagram(
        &self,
        session_id: &str,
        payload: &[u8],
    ) -> Result<(), PipelineError> {
        match serde_json::from_slice::<ClientEvent>(payload) {
            Ok(ClientEvent::BargeIn) => self.handle_barge_in(session_id).await,
            Err(e) => {
                warn!(session = %session_id, "Discarding malformed datagram: {}", e);
                Ok(())
            }
        }
    }

    /// The user started speaking over the agent: stop speech now.
    pub async fn handle_barge_in(&self, session_id: &str) -> Result<(), PipelineError> {
        let received = Instant::now();
        let (session, outbound) = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;
            (entry.session.clone(), entry.outbound_tx.clone())
        };

        // 1. Stop the TTS consumer, waiting only the grace period.
        let grace = Duration::from_millis(self.config.session.barge_in_grace_ms);
        session
            .tts_cancel
            .lock()
            .expect("tts cancel poisoned")
            .cancel();
        let tts_handle = session.tasks.lock().expect("tasks poisoned").tts.take();
        if let Some(handle) = tts_handle {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(session = %session_id, "TTS task exceeded barge-in grace; abandoned");
            }
        }

        // 2–5. Cancel generation, flush queued responses, clear state.
        session.cancel_llm();
        session.flush_tts_queue();
        session.is_agent_speaking.store(false, Ordering::Relaxed);
        session.counters.barge_ins.fetch_add(1, Ordering::Relaxed);

        // 6. Tell the client, reliably.
        let _ = outbound.send(ServerEvent::AgentInterrupted).await;

        // 7. Fresh consumer for whatever comes next.
        let token = CancelToken::new();
        *session.tts_cancel.lock().expect("tts cancel poisoned") = token.clone();
        let consumer = TtsConsumer::new(
            session.clone(),
            self.tts.clone(),
            self.config.tts.clone(),
            outbound,
        );
        session.tasks.lock().expect("tasks poisoned").tts = Some(tokio::spawn(consumer.run(token)));

        info!(
            session = %session_id,
            latency_ms = received.elapsed().as_millis() as u64,
            "Barge-in handled"
        );
        Ok(())
    }

    /// Tear a session down: cancel everything, join (or abort) the tasks,
    /// write the final metrics record, release the transport.
    pub async fn destroy_session(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;
        let session = entry.session;
        info!(session = %session_id, reason, "Destroying session");

        session.is_active.store(false, Ordering::Relaxed);
        session.cancel.cancel();
        if let Some(token) = session.llm_cancel.lock().expect("llm cancel poisoned").take() {
            token.cancel();
        }
        session
            .tts_cancel
            .lock()
            .expect("tts cancel poisoned")
            .cancel();
        session.flush_tts_queue();

        // Closing the entry's channel clones lets ingress and the pump drain
        // out on their own.
        drop(entry.outbound_tx);
        drop(entry._audio_tx);

        let handles = session.tasks.lock().expect("tasks poisoned").drain();
        for mut handle in handles {
            if tokio::time::timeout(TEARDOWN_GRACE, &mut handle).await.is_err() {
                warn!(session = %session_id, "Task exceeded teardown grace; aborting");
                handle.abort();
            }
        }

        let summary = session.metrics.summarize(session.counters.totals());
        self.metrics.record_session(summary).await;
        session.transport.release();
        info!(session = %session_id, "Session destroyed");
        Ok(())
    }

    /// Reclaim sessions that have gone quiet, as if the participant
    /// disconnected.
    pub async fn run_expiry_sweeper(self: Arc<Self>, cancel: CancelToken) {
        let sweep_interval = Duration::from_secs(60);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sweep_interval) => {}
            }

            let expiry = Duration::from_secs(self.config.session.expiry_minutes * 60);
            let expired: Vec<String> = {
                let sessions = self.sessions.read().await;
                sessions
                    .iter()
                    .filter(|(_, entry)| entry.session.idle_for() > expiry)
                    .map(|(id, _)| id.clone())
                    .collect()
            };

            for session_id in expired {
                warn!(session = %session_id, "Session expired after inactivity");
                if let Err(e) = self.destroy_session(&session_id, "inactivity timeout").await {
                    debug!(session = %session_id, "Expiry teardown race: {}", e);
                }
            }
        }
    }

    /// Destroy every session; used at process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in ids {
            let _ = self.destroy_session(&session_id, "server shutdown").await;
        }
    }
}
