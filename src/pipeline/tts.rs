//! Streaming text-to-speech
//!
//! A per-session consumer pulls finalized responses off the bounded queue,
//! splits them into sentence-sized segments, synthesizes each over HTTP
//! (with a fallback provider), and fans the normalized audio out as 20 ms
//! frames: one copy to the outbound audio track, one base64 `tts_chunk`
//! datagram on the lossy channel.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TtsSettings;
use crate::pipeline::audio::{decode_wav, frame_pcm};
use crate::pipeline::session::{approx_tokens, Session};
use crate::pipeline::{backoff_delay, CancelToken};
use crate::transport::ServerEvent;

/// Retries against the primary endpoint before the fallback is consulted.
const PRIMARY_RETRIES: u32 = 2;

/// Split text into sentences on terminators, keeping the terminator.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch == '\n' {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
            continue;
        }
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | ';') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Break an oversized sentence at whitespace before the budget, hard-splitting
/// only when a single word exceeds it.
fn split_oversized(sentence: &str, max_chars: usize) -> Vec<String> {
    if sentence.chars().count() <= max_chars {
        return vec![sentence.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for word in sentence.split_whitespace() {
        let word_chars = word.chars().count();
        if word_chars > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for chunk in chars.chunks(max_chars) {
                pieces.push(chunk.iter().collect());
            }
        } else if current.is_empty() {
            current = word.to_string();
            current_chars = word_chars;
        } else if current_chars + 1 + word_chars <= max_chars {
            current.push(' ');
            current.push_str(word);
            current_chars += 1 + word_chars;
        } else {
            pieces.push(std::mem::take(&mut current));
            current = word.to_string();
            current_chars = word_chars;
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Segment a response into synthesis-sized chunks: 1–2 sentences each,
/// bounded by the token budget (4 chars ≈ 1 token). Sentences shorter than
/// the minimum keep accumulating so the synthesizer is not fed fragments.
pub fn segment_text(text: &str, settings: &TtsSettings) -> Vec<String> {
    let max_chars = settings.chunk_max_tokens.max(1) * 4;
    let min_chars = settings.chunk_min_tokens * 4;
    let max_sentences = settings.chunk_sentences.max(1);

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut sentences_in_current = 0usize;

    for sentence in split_sentences(text) {
        for piece in split_oversized(&sentence, max_chars) {
            let current_chars = current.chars().count();
            if current.is_empty() {
                current = piece;
                sentences_in_current = 1;
            } else if (sentences_in_current < max_sentences || current_chars < min_chars)
                && current_chars + 1 + piece.chars().count() <= max_chars
            {
                current.push(' ');
                current.push_str(&piece);
                sentences_in_current += 1;
            } else {
                segments.push(std::mem::take(&mut current));
                current = piece;
                sentences_in_current = 1;
            }
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

/// HTTP client for the synthesis endpoints (primary + optional fallback).
pub struct TtsClient {
    client: reqwest::Client,
    settings: TtsSettings,
}

impl TtsClient {
    pub fn new(settings: TtsSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    pub fn fallback_endpoint(&self) -> Option<&str> {
        self.settings.fallback_endpoint.as_deref()
    }

    /// Synthesize one segment to WAV bytes: primary with retries, then one
    /// fallback attempt.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        match self
            .synthesize_at(&self.settings.endpoint, text, PRIMARY_RETRIES)
            .await
        {
            Ok(wav) => Ok(wav),
            Err(primary_err) => {
                let Some(fallback) = &self.settings.fallback_endpoint else {
                    return Err(primary_err);
                };
                warn!(
                    "Primary TTS exhausted ({:#}); trying fallback {}",
                    primary_err, fallback
                );
                self.synthesize_at(fallback, text, 0)
                    .await
                    .context("Fallback TTS provider failed")
            }
        }
    }

    async fn synthesize_at(&self, endpoint: &str, text: &str, retries: u32) -> Result<Vec<u8>> {
        let mut last_err = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let request = SpeechRequest {
                text,
                description: &self.settings.description,
                voice: self.settings.voice.as_deref(),
                language: self.settings.language.as_deref(),
            };

            let response = self
                .client
                .post(format!("{}/tts", endpoint))
                .timeout(Duration::from_secs(self.settings.request_timeout_secs))
                .json(&request)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response
                            .bytes()
                            .await
                            .context("Failed to read TTS response body")?;
                        return Ok(bytes.to_vec());
                    }
                    if status.is_server_error() {
                        warn!("TTS {} returned {}", endpoint, status);
                        last_err = Some(anyhow!("TTS returned {}", status));
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(anyhow!("TTS returned {}: {}", status, body));
                }
                Err(e) => {
                    warn!("TTS request to {} failed: {}", endpoint, e);
                    last_err = Some(anyhow!("TTS request failed: {}", e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("TTS synthesis failed")))
    }
}

/// The per-session synthesis consumer. Cancellable at segment and frame
/// boundaries; barge-in restarts a fresh consumer for later responses.
pub struct TtsConsumer {
    session: Arc<Session>,
    client: Arc<TtsClient>,
    settings: TtsSettings,
    outbound: mpsc::Sender<ServerEvent>,
}

impl TtsConsumer {
    pub fn new(
        session: Arc<Session>,
        client: Arc<TtsClient>,
        settings: TtsSettings,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            session,
            client,
            settings,
            outbound,
        }
    }

    pub async fn run(self, cancel: CancelToken) {
        loop {
            let text = tokio::select! {
                _ = cancel.cancelled() => break,
                text = self.session.tts_queue.pop() => text,
            };

            self.session.is_agent_speaking.store(true, Ordering::Relaxed);
            self.speak_response(&text, &cancel).await;
            self.session.is_agent_speaking.store(false, Ordering::Relaxed);

            if cancel.is_cancelled() {
                break;
            }
        }
        debug!(session = %self.session.id, "TTS consumer stopped");
    }

    async fn speak_response(&self, text: &str, cancel: &CancelToken) {
        let segments = segment_text(text, &self.settings);
        debug!(
            session = %self.session.id,
            segments = segments.len(),
            tokens = approx_tokens(text),
            "Synthesizing response"
        );
        let mut first_frame_pending = true;

        for (segment_idx, segment) in segments.iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }

            let started = Instant::now();
            let wav = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.client.synthesize(segment) => match result {
                    Ok(wav) => wav,
                    Err(e) => {
                        warn!(
                            session = %self.session.id,
                            segment = segment_idx + 1,
                            "Skipping segment after synthesis failure: {:#}", e
                        );
                        self.session.counters.errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            };
            self.session
                .metrics
                .record_tts_latency(started.elapsed().as_millis() as f64);

            let pcm = match decode_wav(&wav) {
                Ok(decoded) => decoded.into_pipeline_pcm(),
                Err(e) => {
                    warn!(
                        session = %self.session.id,
                        segment = segment_idx + 1,
                        "Skipping undecodable synthesis payload: {:#}", e
                    );
                    self.session.counters.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let frames = frame_pcm(&pcm);
            for (frame_idx, frame) in frames.iter().enumerate() {
                if cancel.is_cancelled() {
                    return;
                }

                let publish_deadline =
                    Duration::from_millis(self.settings.frame_publish_timeout_ms);
                match tokio::time::timeout(
                    publish_deadline,
                    self.session.transport.write_audio_frame(frame.clone()),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(session = %self.session.id, "Audio track write failed: {}", e)
                    }
                    Err(_) => {
                        warn!(session = %self.session.id, "Audio track write timed out")
                    }
                }

                // Datagram copy is lossy by contract; a full outbound queue
                // drops the chunk rather than stalling the track.
                let chunk = ServerEvent::TtsChunk {
                    audio: BASE64.encode(frame),
                    segment: (segment_idx + 1) as u32,
                    frame: (frame_idx + 1) as u32,
                };
                if self.outbound.try_send(chunk).is_err() {
                    debug!(session = %self.session.id, "Dropped tts_chunk datagram (backpressure)");
                }

                self.session.counters.tts_frames.fetch_add(1, Ordering::Relaxed);

                if first_frame_pending {
                    first_frame_pending = false;
                    if let Some(elapsed) = self.session.since_last_asr_final() {
                        self.session
                            .metrics
                            .record_e2e_latency(elapsed.as_millis() as f64);
                    }
                }
            }

            info!(
                session = %self.session.id,
                segment = segment_idx + 1,
                frames = frames.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Segment synthesized"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TtsSettings {
        TtsSettings::default()
    }

    #[test]
    fn test_split_sentences_terminators() {
        let sentences = split_sentences("Hi there. How are you? Good; great!\nNew line");
        assert_eq!(
            sentences,
            vec!["Hi there.", "How are you?", "Good;", "great!", "New line"]
        );
    }

    #[test]
    fn test_segment_groups_short_sentences() {
        // Two short sentences fit one segment under the default budget.
        let segments = segment_text("Hi there. How are you?", &settings());
        assert_eq!(segments, vec!["Hi there. How are you?"]);
    }

    #[test]
    fn test_segment_respects_sentence_cap() {
        let mut cfg = settings();
        cfg.chunk_sentences = 1;
        cfg.chunk_min_tokens = 0;
        let segments = segment_text("One. Two. Three.", &cfg);
        assert_eq!(segments, vec!["One.", "Two.", "Three."]);
    }

    #[test]
    fn test_segment_packs_fragments_up_to_minimum() {
        let mut cfg = settings();
        cfg.chunk_sentences = 1;
        // Minimum of 4 tokens (16 chars) pulls tiny sentences together.
        cfg.chunk_min_tokens = 4;
        let segments = segment_text("Yes. No. Maybe so; we will see.", &cfg);
        assert_eq!(segments, vec!["Yes. No. Maybe so;", "we will see."]);
    }

    #[test]
    fn test_segment_splits_oversized_at_whitespace() {
        let mut cfg = settings();
        cfg.chunk_max_tokens = 5; // 20 chars
        let segments = segment_text("this sentence has no terminator and keeps going", &cfg);
        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.chars().count() <= 20));
        // Whitespace split, not mid-word.
        assert!(segments.iter().all(|s| !s.starts_with(' ') && !s.ends_with(' ')));
        assert_eq!(
            segments.join(" "),
            "this sentence has no terminator and keeps going"
        );
    }

    #[test]
    fn test_segment_hard_splits_unbroken_word() {
        let mut cfg = settings();
        cfg.chunk_max_tokens = 2; // 8 chars
        let segments = segment_text("abcdefghijklmnop", &cfg);
        assert_eq!(segments, vec!["abcdefgh", "ijklmnop"]);
    }

    #[test]
    fn test_segment_empty_text() {
        assert!(segment_text("", &settings()).is_empty());
        assert!(segment_text("   \n ", &settings()).is_empty());
    }

    #[test]
    fn test_speech_request_optional_fields() {
        let request = SpeechRequest {
            text: "hi",
            description: "calm",
            voice: None,
            language: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("voice"));
        assert!(!json.contains("language"));

        let request = SpeechRequest {
            text: "hi",
            description: "calm",
            voice: Some("nova"),
            language: Some("en"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["voice"], "nova");
    }
}
