//! Streaming speech-to-text
//!
//! A background windower wakes every `slide_ms`, snapshots the session's
//! rolling buffer, and submits the most recent `window_ms` of audio to the
//! STT endpoint as a WAV multipart upload. Growing transcripts are tracked
//! per utterance; trailing silence (RMS under the configured floor) or an
//! explicit flush finalizes the utterance.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AsrSettings;
use crate::metrics::SessionMetrics;
use crate::pipeline::audio::{encode_wav, rms_energy, RollingBuffer, TARGET_SAMPLE_RATE};
use crate::pipeline::{backoff_delay, CancelToken, MAX_TRANSIENT_RETRIES};

/// Transcript events flowing to the coordinator's dispatch task.
#[derive(Debug, Clone, PartialEq)]
pub enum AsrEvent {
    /// Monotonically growing transcript for the active utterance.
    Partial { text: String, chunk_index: u64 },
    /// Emitted exactly once per completed utterance, carrying its full text.
    Final { text: String },
    /// A window failed permanently; counted, never published to the client.
    Error,
}

/// Response body of `POST /audio/transcriptions`.
#[derive(Debug, serde::Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// HTTP client for the transcription endpoint.
pub struct SttClient {
    client: reqwest::Client,
    settings: AsrSettings,
}

impl SttClient {
    pub fn new(settings: AsrSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    /// Transcribe one WAV-encoded window. Transient failures (5xx, connect,
    /// timeout) retry with jittered backoff; 4xx is reported once and not
    /// retried.
    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        let mut last_err = None;

        for attempt in 0..=MAX_TRANSIENT_RETRIES {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1);
                debug!("Retrying transcription in {:?} (attempt {})", delay, attempt + 1);
                tokio::time::sleep(delay).await;
            }

            match self.try_transcribe(wav.clone()).await {
                Ok(text) => return Ok(text),
                Err(e) if e.transient => {
                    warn!("Transient STT failure: {}", e.message);
                    last_err = Some(e.message);
                }
                Err(e) => return Err(anyhow!("STT request rejected: {}", e.message)),
            }
        }

        Err(anyhow!(
            "STT failed after {} attempts: {}",
            MAX_TRANSIENT_RETRIES + 1,
            last_err.unwrap_or_default()
        ))
    }

    async fn try_transcribe(&self, wav: Vec<u8>) -> std::result::Result<String, SttFailure> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("window.wav")
            .mime_str("audio/wav")
            .map_err(|e| SttFailure::fatal(format!("Invalid multipart: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.settings.model.clone())
            .text("language", self.settings.language.clone());

        let mut request = self
            .client
            .post(format!("{}/audio/transcriptions", self.settings.endpoint))
            .timeout(Duration::from_secs(self.settings.request_timeout_secs))
            .multipart(form);
        if let Some(key) = &self.settings.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SttFailure::transient(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SttFailure::transient(format!("STT returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SttFailure::fatal(format!("STT returned {}: {}", status, body)));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| SttFailure::transient(format!("Bad STT response body: {}", e)))?;
        Ok(parsed.text.trim().to_string())
    }
}

struct SttFailure {
    transient: bool,
    message: String,
}

impl SttFailure {
    fn transient(message: String) -> Self {
        Self { transient: true, message }
    }

    fn fatal(message: String) -> Self {
        Self { transient: false, message }
    }
}

/// Utterance-scoped transcript accumulator.
///
/// A new result that extends the current utterance (prefix-compatible up to
/// whitespace/case normalization) replaces it; anything else finalizes the
/// current utterance and starts a new one.
#[derive(Debug, Default)]
pub struct UtteranceTracker {
    current: String,
}

/// What a new transcription result did to the utterance state.
#[derive(Debug, Clone, PartialEq)]
pub enum UtteranceUpdate {
    /// The utterance grew (or started); emit a partial with this text.
    Grew { text: String },
    /// A new utterance began; emit the old final, then the new partial.
    Restarted { finalized: String, text: String },
    /// The result added nothing (identical or empty).
    Unchanged,
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl UtteranceTracker {
    pub fn is_active(&self) -> bool {
        !self.current.is_empty()
    }

    pub fn observe(&mut self, new_text: &str) -> UtteranceUpdate {
        let new_text = new_text.trim();
        if new_text.is_empty() {
            return UtteranceUpdate::Unchanged;
        }

        if self.current.is_empty() {
            self.current = new_text.to_string();
            return UtteranceUpdate::Grew {
                text: self.current.clone(),
            };
        }

        let old_norm = normalize(&self.current);
        let new_norm = normalize(new_text);
        if new_norm == old_norm {
            return UtteranceUpdate::Unchanged;
        }
        if new_norm.starts_with(&old_norm) {
            self.current = new_text.to_string();
            return UtteranceUpdate::Grew {
                text: self.current.clone(),
            };
        }

        let finalized = std::mem::replace(&mut self.current, new_text.to_string());
        UtteranceUpdate::Restarted {
            finalized,
            text: self.current.clone(),
        }
    }

    /// Take the active utterance for finalization, if any.
    pub fn finalize(&mut self) -> Option<String> {
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}

/// The sliding-window ASR task for one session.
pub struct AsrWindower {
    buffer: Arc<RollingBuffer>,
    stt: Arc<SttClient>,
    settings: AsrSettings,
    events: mpsc::Sender<AsrEvent>,
    metrics: Arc<SessionMetrics>,
}

impl AsrWindower {
    pub fn new(
        buffer: Arc<RollingBuffer>,
        stt: Arc<SttClient>,
        settings: AsrSettings,
        events: mpsc::Sender<AsrEvent>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            buffer,
            stt,
            settings,
            events,
            metrics,
        }
    }

    /// Run until cancelled; on exit any active utterance is flushed as a
    /// final.
    pub async fn run(self, cancel: CancelToken) {
        let window_samples = (self.settings.window_ms * TARGET_SAMPLE_RATE as u64 / 1000) as usize;
        let silence_samples = (self.settings.silence_ms * TARGET_SAMPLE_RATE as u64 / 1000) as usize;
        let mut interval = tokio::time::interval(Duration::from_millis(self.settings.slide_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut tracker = UtteranceTracker::default();
        let mut chunk_index: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Silence endpointing: a quiet tail while an utterance is active
            // closes the utterance.
            if tracker.is_active() {
                let tail = self.buffer.tail(silence_samples);
                if tail.len() >= silence_samples
                    && rms_energy(&tail) < self.settings.silence_rms_threshold
                {
                    if let Some(text) = tracker.finalize() {
                        info!("Utterance finalized by silence: \"{}\"", text);
                        if self.events.send(AsrEvent::Final { text }).await.is_err() {
                            break;
                        }
                    }
                    continue;
                }
            }

            let snapshot = self.buffer.snapshot();
            if snapshot.len() < window_samples {
                continue;
            }
            let window = &snapshot[snapshot.len() - window_samples..];

            // Energy gate: silence never reaches the provider.
            if rms_energy(window) < self.settings.silence_rms_threshold {
                continue;
            }

            let wav = match encode_wav(window, TARGET_SAMPLE_RATE) {
                Ok(wav) => wav,
                Err(e) => {
                    error!("WAV encode failed: {}", e);
                    continue;
                }
            };

            let started = Instant::now();
            let text = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.stt.transcribe(wav) => match result {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Transcription failed: {:#}", e);
                        if self.events.send(AsrEvent::Error).await.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            };

            self.metrics
                .record_asr_latency(started.elapsed().as_millis() as f64);
            debug!(
                "ASR window #{} in {} ms: \"{}\"",
                chunk_index,
                started.elapsed().as_millis(),
                text
            );

            match tracker.observe(&text) {
                UtteranceUpdate::Grew { text } => {
                    chunk_index += 1;
                    if self
                        .events
                        .send(AsrEvent::Partial { text, chunk_index })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                UtteranceUpdate::Restarted { finalized, text } => {
                    chunk_index += 1;
                    if self.events.send(AsrEvent::Final { text: finalized }).await.is_err() {
                        break;
                    }
                    if self
                        .events
                        .send(AsrEvent::Partial { text, chunk_index })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                UtteranceUpdate::Unchanged => {}
            }
        }

        // Session end: flush whatever is still accumulating.
        if let Some(text) = tracker.finalize() {
            info!("Utterance finalized by session end: \"{}\"", text);
            let _ = self.events.send(AsrEvent::Final { text }).await;
        }
    }
}

/// Validate settings early so a broken deployment fails at startup, not at
/// the first utterance.
pub fn validate_settings(settings: &AsrSettings) -> Result<()> {
    if settings.window_ms == 0 || settings.slide_ms == 0 {
        bail!("ASR window and slide must be non-zero");
    }
    if settings.slide_ms > settings.window_ms {
        bail!(
            "ASR slide ({} ms) must not exceed window ({} ms)",
            settings.slide_ms,
            settings.window_ms
        );
    }
    reqwest::Url::parse(&settings.endpoint)
        .with_context(|| format!("Invalid STT endpoint: {}", settings.endpoint))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_growth_is_partial() {
        let mut tracker = UtteranceTracker::default();
        assert_eq!(
            tracker.observe("tell me"),
            UtteranceUpdate::Grew {
                text: "tell me".to_string()
            }
        );
        assert_eq!(
            tracker.observe("tell me a fact"),
            UtteranceUpdate::Grew {
                text: "tell me a fact".to_string()
            }
        );
        assert!(tracker.is_active());
    }

    #[test]
    fn test_tracker_prefix_up_to_whitespace_and_case() {
        let mut tracker = UtteranceTracker::default();
        tracker.observe("Tell  me");
        assert_eq!(
            tracker.observe("tell me a fact"),
            UtteranceUpdate::Grew {
                text: "tell me a fact".to_string()
            }
        );
    }

    #[test]
    fn test_tracker_restart_finalizes_old_utterance() {
        let mut tracker = UtteranceTracker::default();
        tracker.observe("tell me a fact");
        let update = tracker.observe("what time is it");
        assert_eq!(
            update,
            UtteranceUpdate::Restarted {
                finalized: "tell me a fact".to_string(),
                text: "what time is it".to_string(),
            }
        );
    }

    #[test]
    fn test_tracker_ignores_identical_and_empty() {
        let mut tracker = UtteranceTracker::default();
        tracker.observe("hello there");
        assert_eq!(tracker.observe("hello  THERE"), UtteranceUpdate::Unchanged);
        assert_eq!(tracker.observe("   "), UtteranceUpdate::Unchanged);
    }

    #[test]
    fn test_tracker_finalize_drains() {
        let mut tracker = UtteranceTracker::default();
        assert_eq!(tracker.finalize(), None);
        tracker.observe("hello");
        assert_eq!(tracker.finalize(), Some("hello".to_string()));
        assert!(!tracker.is_active());
    }

    #[test]
    fn test_validate_settings() {
        let mut settings = AsrSettings::default();
        assert!(validate_settings(&settings).is_ok());

        settings.slide_ms = settings.window_ms + 1;
        assert!(validate_settings(&settings).is_err());

        let mut settings = AsrSettings::default();
        settings.endpoint = "not a url".to_string();
        assert!(validate_settings(&settings).is_err());
    }
}
