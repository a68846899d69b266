//! Configuration management
//!
//! Layered: serde defaults → optional TOML file → environment overrides.
//! The environment keys are the deployment contract (container-friendly);
//! the file is a convenience for local runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub asr: AsrSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub tts: TtsSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrSettings {
    /// Transcription window duration
    #[serde(default = "default_asr_window_ms")]
    pub window_ms: u64,
    /// Interval between windows
    #[serde(default = "default_asr_slide_ms")]
    pub slide_ms: u64,
    /// Trailing silence that finalizes an utterance
    #[serde(default = "default_asr_silence_ms")]
    pub silence_ms: u64,
    /// RMS floor below which audio counts as silence
    #[serde(default = "default_silence_rms")]
    pub silence_rms_threshold: f32,
    #[serde(default = "default_stt_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_stt_language")]
    pub language: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_asr_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_asr_window_ms() -> u64 { 500 }
fn default_asr_slide_ms() -> u64 { 250 }
fn default_asr_silence_ms() -> u64 { 800 }
fn default_silence_rms() -> f32 { 200.0 }
fn default_stt_endpoint() -> String { "http://127.0.0.1:8001".to_string() }
fn default_stt_model() -> String { "whisper-1".to_string() }
fn default_stt_language() -> String { "en".to_string() }
fn default_asr_timeout_secs() -> u64 { 10 }

impl Default for AsrSettings {
    fn default() -> Self {
        Self {
            window_ms: default_asr_window_ms(),
            slide_ms: default_asr_slide_ms(),
            silence_ms: default_asr_silence_ms(),
            silence_rms_threshold: default_silence_rms(),
            endpoint: default_stt_endpoint(),
            model: default_stt_model(),
            language: default_stt_language(),
            api_key: None,
            request_timeout_secs: default_asr_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    /// Emit a partial every this many stream deltas...
    #[serde(default = "default_partial_every_deltas")]
    pub partial_every_deltas: u32,
    /// ...but never more often than this
    #[serde(default = "default_partial_min_interval_ms")]
    pub partial_min_interval_ms: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_llm_endpoint() -> String { "http://127.0.0.1:8002".to_string() }
fn default_llm_model() -> String { "llama-3.1-8b-instruct".to_string() }
fn default_llm_max_tokens() -> u32 { 256 }
fn default_llm_temperature() -> f32 { 0.7 }
fn default_partial_every_deltas() -> u32 { 5 }
fn default_partial_min_interval_ms() -> u64 { 100 }
fn default_llm_timeout_secs() -> u64 { 30 }

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            api_key: None,
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            partial_every_deltas: default_partial_every_deltas(),
            partial_min_interval_ms: default_partial_min_interval_ms(),
            request_timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    /// Tried once after the primary exhausts its retries
    #[serde(default)]
    pub fallback_endpoint: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// Style prompt forwarded to the synthesis provider
    #[serde(default = "default_tts_description")]
    pub description: String,
    /// Target sentences per synthesis segment
    #[serde(default = "default_chunk_sentences")]
    pub chunk_sentences: usize,
    #[serde(default = "default_chunk_min_tokens")]
    pub chunk_min_tokens: usize,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    #[serde(default = "default_tts_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Per-frame publish deadline toward the transport
    #[serde(default = "default_frame_publish_timeout_ms")]
    pub frame_publish_timeout_ms: u64,
}

fn default_tts_endpoint() -> String { "http://127.0.0.1:8003".to_string() }
fn default_tts_description() -> String {
    "A calm, clear voice speaking at a natural pace".to_string()
}
fn default_chunk_sentences() -> usize { 2 }
fn default_chunk_min_tokens() -> usize { 15 }
fn default_chunk_max_tokens() -> usize { 25 }
fn default_tts_timeout_secs() -> u64 { 15 }
fn default_frame_publish_timeout_ms() -> u64 { 200 }

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            endpoint: default_tts_endpoint(),
            fallback_endpoint: None,
            voice: None,
            language: None,
            description: default_tts_description(),
            chunk_sentences: default_chunk_sentences(),
            chunk_min_tokens: default_chunk_min_tokens(),
            chunk_max_tokens: default_chunk_max_tokens(),
            request_timeout_secs: default_tts_timeout_secs(),
            frame_publish_timeout_ms: default_frame_publish_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,
    /// Idle sessions are reclaimed after this long without audio
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: u64,
    /// Conversation history budget (4 chars ≈ 1 token)
    #[serde(default = "default_context_tokens")]
    pub memory_context_tokens: usize,
    #[serde(default = "default_queue_capacity")]
    pub tts_queue_capacity: usize,
    /// Rolling audio buffer span
    #[serde(default = "default_buffer_ms")]
    pub buffer_ms: u64,
    /// Ingress progress log cadence, in frames
    #[serde(default = "default_ingress_log_every")]
    pub ingress_log_every: u64,
    /// How long barge-in waits for the TTS task before abandoning it
    #[serde(default = "default_barge_in_grace_ms")]
    pub barge_in_grace_ms: u64,
    /// Producer blocking deadline when the TTS queue is full
    #[serde(default = "default_queue_push_deadline_ms")]
    pub queue_push_deadline_ms: u64,
}

fn default_max_sessions() -> usize { 5 }
fn default_expiry_minutes() -> u64 { 10 }
fn default_context_tokens() -> usize { 2048 }
fn default_queue_capacity() -> usize { 16 }
fn default_buffer_ms() -> u64 { 1000 }
fn default_ingress_log_every() -> u64 { 50 }
fn default_barge_in_grace_ms() -> u64 { 200 }
fn default_queue_push_deadline_ms() -> u64 { 500 }

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_sessions(),
            expiry_minutes: default_expiry_minutes(),
            memory_context_tokens: default_context_tokens(),
            tts_queue_capacity: default_queue_capacity(),
            buffer_ms: default_buffer_ms(),
            ingress_log_every: default_ingress_log_every(),
            barge_in_grace_ms: default_barge_in_grace_ms(),
            queue_push_deadline_ms: default_queue_push_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_health_interval_secs() -> u64 { 30 }
fn default_probe_timeout_secs() -> u64 { 3 }

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_health_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_path")]
    pub save_path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_metrics_path() -> PathBuf {
    PathBuf::from("./metrics/sessions.jsonl")
}

fn default_true() -> bool { true }

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            save_path: default_metrics_path(),
            enabled: default_true(),
        }
    }
}

impl Config {
    /// Load configuration: file (when present) then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply the documented environment overrides on top of the current
    /// values. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        // ASR
        env_override("ASR_BUFFER_WINDOW_MS", &mut self.asr.window_ms);
        env_override("ASR_BUFFER_SLIDE_MS", &mut self.asr.slide_ms);
        env_override("ASR_SILENCE_MS", &mut self.asr.silence_ms);
        env_override("ASR_SILENCE_RMS_THRESHOLD", &mut self.asr.silence_rms_threshold);
        env_override("STT_ENDPOINT", &mut self.asr.endpoint);
        env_override("STT_MODEL", &mut self.asr.model);
        env_override("STT_LANGUAGE", &mut self.asr.language);
        env_override_opt("STT_API_KEY", &mut self.asr.api_key);

        // LLM
        env_override("LLM_ENDPOINT", &mut self.llm.endpoint);
        env_override("LLM_MODEL", &mut self.llm.model);
        env_override_opt("LLM_API_KEY", &mut self.llm.api_key);
        env_override("LLM_MAX_TOKENS", &mut self.llm.max_tokens);
        env_override("LLM_TEMPERATURE", &mut self.llm.temperature);

        // TTS
        env_override("TTS_ENDPOINT", &mut self.tts.endpoint);
        env_override_opt("TTS_FALLBACK_ENDPOINT", &mut self.tts.fallback_endpoint);
        env_override_opt("TTS_VOICE", &mut self.tts.voice);
        env_override_opt("TTS_LANGUAGE", &mut self.tts.language);
        env_override("TTS_CHUNK_SIZE_SENTENCES", &mut self.tts.chunk_sentences);

        // Session
        env_override("SESSION_EXPIRY_MINUTES", &mut self.session.expiry_minutes);
        env_override("MAX_CONCURRENT_SESSIONS", &mut self.session.max_concurrent_sessions);
        env_override("MEMORY_CONTEXT_TOKENS", &mut self.session.memory_context_tokens);

        // Health
        env_override("HEALTH_CHECK_INTERVAL", &mut self.health.check_interval_secs);
        env_override("SERVICE_TIMEOUT", &mut self.health.probe_timeout_secs);

        // Metrics
        env_override("METRICS_SAVE_PATH", &mut self.metrics.save_path);
        env_override("ENABLE_METRICS", &mut self.metrics.enabled);
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}

fn env_override_opt(key: &str, target: &mut Option<String>) {
    if let Ok(raw) = std::env::var(key) {
        if raw.is_empty() {
            *target = None;
        } else {
            *target = Some(raw);
        }
    }
}

/// Resolve the config file path: explicit override, then the platform
/// config directory.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("VOICE_AGENT_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    directories::ProjectDirs::from("com", "voice-agent", "voice-agent")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Render the resolved configuration for `voice-agent config`.
pub fn render_config(config: &Config) -> String {
    toml::to_string_pretty(config).unwrap_or_else(|_| "# <unrenderable>\n".to_string())
}
