//! End-to-end pipeline tests against in-process mock providers.
//!
//! A small axum app stands in for the STT, LLM, and TTS endpoints, and a
//! recording transport captures every datagram and audio frame the pipeline
//! publishes.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use voice_agent::config::Config;
use voice_agent::metrics::MetricsManager;
use voice_agent::pipeline::audio::encode_wav;
use voice_agent::pipeline::coordinator::{PipelineCoordinator, SessionHandle};
use voice_agent::transport::{MediaTransport, PcmFrame};

// ─── Mock inference providers ────────────────────────────────

struct MockProviders {
    stt_calls: AtomicUsize,
    stt_fail_remaining: AtomicUsize,
    /// Progressive transcripts returned call by call (last one repeats).
    stt_texts: Vec<&'static str>,
    llm_calls: AtomicUsize,
    llm_text: &'static str,
    /// Pause between SSE deltas.
    llm_delta_delay_ms: u64,
    /// Extra stall before the second delta (cancellation tests).
    llm_stall_ms: u64,
    tts_calls: AtomicUsize,
    tts_delay_ms: u64,
    /// Duration of synthesized audio per segment.
    tts_audio_ms: u64,
}

impl Default for MockProviders {
    fn default() -> Self {
        Self {
            stt_calls: AtomicUsize::new(0),
            stt_fail_remaining: AtomicUsize::new(0),
            stt_texts: vec!["tell me", "tell me a fact", "tell me a fact about space"],
            llm_calls: AtomicUsize::new(0),
            llm_text: "Space is mostly empty. Nearly all of its mass sits in stars.",
            llm_delta_delay_ms: 25,
            llm_stall_ms: 0,
            tts_calls: AtomicUsize::new(0),
            tts_delay_ms: 10,
            tts_audio_ms: 200,
        }
    }
}

async fn stt_handler(State(state): State<Arc<MockProviders>>) -> Response {
    let call = state.stt_calls.fetch_add(1, Ordering::SeqCst);
    if state.stt_fail_remaining.load(Ordering::SeqCst) > 0 {
        state.stt_fail_remaining.fetch_sub(1, Ordering::SeqCst);
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response();
    }
    let text = state.stt_texts[call.min(state.stt_texts.len() - 1)];
    Json(json!({ "text": text })).into_response()
}

async fn llm_handler(State(state): State<Arc<MockProviders>>) -> Response {
    state.llm_calls.fetch_add(1, Ordering::SeqCst);

    let mut events: Vec<String> = state
        .llm_text
        .split_inclusive(' ')
        .map(|word| {
            format!(
                "data: {}\n\n",
                json!({ "choices": [{ "delta": { "content": word } }] })
            )
        })
        .collect();
    events.push("data: [DONE]\n\n".to_string());

    let delta_delay = state.llm_delta_delay_ms;
    let stall = state.llm_stall_ms;
    let stream = futures_util::stream::iter(events.into_iter().enumerate()).then(
        move |(index, event)| async move {
            let delay = if index == 1 && stall > 0 { stall } else { delta_delay };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, std::convert::Infallible>(event)
        },
    );

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn tts_handler(State(state): State<Arc<MockProviders>>) -> Response {
    state.tts_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(state.tts_delay_ms)).await;

    let samples = vec![2500i16; (state.tts_audio_ms * 16) as usize];
    let wav = encode_wav(&samples, 16_000).unwrap();
    Response::builder()
        .header("content-type", "audio/wav")
        .body(Body::from(wav))
        .unwrap()
}

async fn provider_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serve the mock providers on an ephemeral port, returning their base URL.
async fn spawn_providers(state: Arc<MockProviders>) -> String {
    let app = Router::new()
        .route("/audio/transcriptions", post(stt_handler))
        .route("/chat/completions", post(llm_handler))
        .route("/tts", post(tts_handler))
        .route("/health", get(provider_health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ─── Recording transport ─────────────────────────────────────

#[derive(Default)]
struct RecordingTransport {
    reliable: Mutex<Vec<Value>>,
    lossy: Mutex<Vec<Value>>,
    audio_frames: AtomicUsize,
    released: AtomicBool,
}

impl RecordingTransport {
    fn reliable_of(&self, kind: &str) -> Vec<Value> {
        self.reliable
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v["type"] == kind)
            .cloned()
            .collect()
    }

    fn lossy_chunks(&self) -> Vec<Value> {
        self.lossy.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaTransport for RecordingTransport {
    async fn publish_reliable(&self, payload: Vec<u8>) -> Result<()> {
        let value: Value = serde_json::from_slice(&payload)?;
        self.reliable.lock().unwrap().push(value);
        Ok(())
    }

    async fn publish_lossy(&self, payload: Vec<u8>) -> Result<()> {
        let value: Value = serde_json::from_slice(&payload)?;
        self.lossy.lock().unwrap().push(value);
        Ok(())
    }

    async fn write_audio_frame(&self, pcm: Vec<u8>) -> Result<()> {
        assert_eq!(pcm.len(), 640, "audio frames must be 20 ms of PCM16");
        self.audio_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

// ─── Harness helpers ─────────────────────────────────────────

fn test_config(base_url: &str) -> Config {
    let mut config = Config::default();
    config.asr.endpoint = base_url.to_string();
    config.llm.endpoint = base_url.to_string();
    config.tts.endpoint = base_url.to_string();
    config.metrics.enabled = false;
    config
}

fn coordinator_for(config: Config) -> Arc<PipelineCoordinator> {
    let metrics = Arc::new(MetricsManager::new("unused.jsonl".into(), false));
    Arc::new(PipelineCoordinator::new(config, metrics))
}

/// One 10 ms frame of 48 kHz stereo at a constant level.
fn stereo_frame(level: i16) -> PcmFrame {
    PcmFrame {
        samples: vec![level; 960],
        sample_rate: 48_000,
        channels: 2,
        samples_per_channel: 480,
    }
}

/// Feed audio at real-time pace so the sliding window sees it.
async fn push_audio(handle: &SessionHandle, level: i16, duration_ms: u64) {
    for _ in 0..duration_ms / 10 {
        handle.push_frame(stereo_frame(level)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

// ─── Scenarios ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_speech_to_audio() {
    let providers = Arc::new(MockProviders::default());
    let base_url = spawn_providers(providers.clone()).await;
    let coordinator = coordinator_for(test_config(&base_url));
    let transport = Arc::new(RecordingTransport::default());

    let handle = coordinator
        .create_session("alice", transport.clone())
        .await
        .unwrap();

    // Speech, then enough silence to end the utterance.
    push_audio(&handle, 3000, 1200).await;
    push_audio(&handle, 0, 1000).await;

    assert!(
        wait_until(Duration::from_secs(10), || {
            !transport.lossy_chunks().is_empty()
        })
        .await,
        "expected tts_chunk datagrams"
    );

    let partials = transport.reliable_of("asr_partial");
    assert!(!partials.is_empty(), "expected asr_partial events");

    let finals = transport.reliable_of("asr_final");
    assert_eq!(finals.len(), 1, "exactly one asr_final per utterance");
    assert!(finals[0]["text"].as_str().unwrap().contains("space"));

    assert!(
        wait_until(Duration::from_secs(5), || {
            transport.reliable_of("llm_final").len() == 1
        })
        .await,
        "expected exactly one llm_final"
    );
    let llm_final = transport.reliable_of("llm_final");
    assert!(llm_final[0]["text"].as_str().unwrap().contains("Space"));
    assert!(!transport.reliable_of("llm_partial").is_empty());

    // Frames start at segment 1, frame 1 and stay ordered per segment.
    let chunks = transport.lossy_chunks();
    assert_eq!(chunks[0]["segment"], 1);
    assert_eq!(chunks[0]["frame"], 1);
    assert!(transport.audio_frames.load(Ordering::SeqCst) >= 10);

    let session = coordinator.session(handle.session_id()).await.unwrap();
    assert!(session.counters.asr_chunks.load(Ordering::Relaxed) >= 1);
    assert_eq!(session.counters.errors.load(Ordering::Relaxed), 0);

    coordinator
        .destroy_session(handle.session_id(), "test done")
        .await
        .unwrap();
    assert!(transport.released.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silence_triggers_nothing() {
    let providers = Arc::new(MockProviders::default());
    let base_url = spawn_providers(providers.clone()).await;
    let coordinator = coordinator_for(test_config(&base_url));
    let transport = Arc::new(RecordingTransport::default());

    let handle = coordinator
        .create_session("quiet", transport.clone())
        .await
        .unwrap();

    push_audio(&handle, 0, 1500).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(providers.stt_calls.load(Ordering::SeqCst), 0);
    assert_eq!(providers.llm_calls.load(Ordering::SeqCst), 0);
    assert!(transport.reliable.lock().unwrap().is_empty());
    assert!(transport.lossy_chunks().is_empty());

    coordinator
        .destroy_session(handle.session_id(), "test done")
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stt_5xx_then_recovery_is_invisible() {
    let providers = Arc::new(MockProviders {
        stt_fail_remaining: AtomicUsize::new(2),
        ..Default::default()
    });
    let base_url = spawn_providers(providers.clone()).await;
    let coordinator = coordinator_for(test_config(&base_url));
    let transport = Arc::new(RecordingTransport::default());

    let handle = coordinator
        .create_session("retry", transport.clone())
        .await
        .unwrap();

    push_audio(&handle, 3000, 1200).await;

    assert!(
        wait_until(Duration::from_secs(10), || {
            !transport.reliable_of("asr_partial").is_empty()
        })
        .await,
        "expected a partial after retries"
    );

    // Two 503s were consumed, then a success.
    assert!(providers.stt_calls.load(Ordering::SeqCst) >= 3);
    let session = coordinator.session(handle.session_id()).await.unwrap();
    assert_eq!(session.counters.errors.load(Ordering::Relaxed), 0);

    coordinator
        .destroy_session(handle.session_id(), "test done")
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barge_in_stops_playback() {
    let providers = Arc::new(MockProviders {
        // Slow synthesis so the barge-in lands mid-response.
        tts_delay_ms: 400,
        tts_audio_ms: 500,
        ..Default::default()
    });
    let base_url = spawn_providers(providers.clone()).await;
    let mut config = test_config(&base_url);
    config.tts.chunk_sentences = 1;
    config.tts.chunk_min_tokens = 1;
    let coordinator = coordinator_for(config);
    let transport = Arc::new(RecordingTransport::default());

    let handle = coordinator
        .create_session("interrupter", transport.clone())
        .await
        .unwrap();
    let session = coordinator.session(handle.session_id()).await.unwrap();

    // Queue a multi-segment response directly; the consumer picks it up.
    session
        .tts_queue
        .push(
            "First sentence here. Second sentence follows. Third one too. And a fourth."
                .to_string(),
            Duration::from_millis(100),
        )
        .await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            !transport.lossy_chunks().is_empty()
        })
        .await,
        "expected playback to start"
    );

    coordinator
        .handle_client_datagram(handle.session_id(), br#"{"type":"barge_in"}"#)
        .await
        .unwrap();

    assert_eq!(transport.reliable_of("agent_interrupted").len(), 1);
    assert_eq!(session.counters.barge_ins.load(Ordering::Relaxed), 1);
    assert!(session.tts_queue.is_empty());
    assert!(!session.is_agent_speaking.load(Ordering::Relaxed));

    // No further chunks for the interrupted response.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = transport.lossy_chunks().len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.lossy_chunks().len(), settled);

    coordinator
        .destroy_session(handle.session_id(), "test done")
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroy_mid_stream_suppresses_llm_final() {
    let providers = Arc::new(MockProviders {
        // First delta arrives, then the stream stalls.
        llm_stall_ms: 3000,
        ..Default::default()
    });
    let base_url = spawn_providers(providers.clone()).await;
    let coordinator = coordinator_for(test_config(&base_url));
    let transport = Arc::new(RecordingTransport::default());

    let handle = coordinator
        .create_session("doomed", transport.clone())
        .await
        .unwrap();

    push_audio(&handle, 3000, 1200).await;
    push_audio(&handle, 0, 1000).await;

    assert!(
        wait_until(Duration::from_secs(10), || {
            providers.llm_calls.load(Ordering::SeqCst) >= 1
        })
        .await,
        "expected the LLM stream to start"
    );

    coordinator
        .destroy_session(handle.session_id(), "participant left")
        .await
        .unwrap();

    // Cancellation emits no final and commits nothing.
    assert!(transport.reliable_of("llm_final").is_empty());
    assert!(transport.lossy_chunks().is_empty());
    assert!(transport.released.load(Ordering::SeqCst));
    assert_eq!(coordinator.session_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frames_are_ordered_within_segments() {
    let providers = Arc::new(MockProviders::default());
    let base_url = spawn_providers(providers.clone()).await;
    let coordinator = coordinator_for(test_config(&base_url));
    let transport = Arc::new(RecordingTransport::default());

    let handle = coordinator
        .create_session("ordered", transport.clone())
        .await
        .unwrap();
    let session = coordinator.session(handle.session_id()).await.unwrap();

    session
        .tts_queue
        .push("One short reply.".to_string(), Duration::from_millis(100))
        .await;

    // 200 ms of audio -> 10 frames for the single segment.
    assert!(
        wait_until(Duration::from_secs(5), || {
            transport.lossy_chunks().len() >= 10
        })
        .await,
        "expected all frames"
    );

    let chunks = transport.lossy_chunks();
    let mut last = (0u64, 0u64);
    for chunk in &chunks {
        let key = (
            chunk["segment"].as_u64().unwrap(),
            chunk["frame"].as_u64().unwrap(),
        );
        assert!(key > last, "frames out of order: {:?} after {:?}", key, last);
        last = key;
        // 640 bytes of PCM16 -> 856 base64 characters.
        assert_eq!(chunk["audio"].as_str().unwrap().len(), 856);
    }

    coordinator
        .destroy_session(handle.session_id(), "test done")
        .await
        .unwrap();
}
