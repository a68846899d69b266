//! Streaming language-model stage
//!
//! Opens a server-sent-events chat completion per finalized transcript,
//! accumulates deltas, and surfaces batched partials plus a single final.
//! Cancellation aborts the connection and emits nothing.

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::LlmSettings;
use crate::pipeline::session::{ConversationHistory, Role};
use crate::pipeline::{backoff_delay, CancelToken, MAX_TRANSIENT_RETRIES};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// System prompt for the voice persona. Responses are spoken aloud, so the
/// model is steered away from markup.
const VOICE_SYSTEM_PROMPT: &str = "You are a helpful AI assistant in a real-time voice \
conversation. Keep responses concise and conversational - aim for 1-3 sentences unless the \
user asks for detail. Do not use markdown, bullet points, or code blocks; your responses \
will be spoken aloud.";

/// Build the request message list: system prompt, rolling history, then the
/// new user turn.
pub fn build_messages(history: &ConversationHistory, user_text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(VOICE_SYSTEM_PROMPT));
    for turn in history.turns() {
        messages.push(match turn.role {
            Role::User => ChatMessage::user(&turn.text),
            Role::Agent => ChatMessage::assistant(&turn.text),
        });
    }
    messages.push(ChatMessage::user(user_text));
    messages
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Completed stream: full text plus how many deltas arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResult {
    pub text: String,
    pub token_count: u64,
}

/// HTTP client for the chat-completion endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    settings: LlmSettings,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    fn request_builder(&self, messages: &[ChatMessage]) -> reqwest::RequestBuilder {
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: messages.to_vec(),
            stream: true,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.settings.endpoint))
            .timeout(Duration::from_secs(self.settings.request_timeout_secs))
            .json(&request);
        if let Some(key) = &self.settings.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }

    /// Stream one chat completion.
    ///
    /// `on_partial` fires with the accumulated text every
    /// `partial_every_deltas` deltas, rate-limited to
    /// `partial_min_interval_ms`. Returns `Ok(None)` when cancelled — in
    /// that case nothing was emitted for the final and the caller must not
    /// commit anything. Connection failures before the first delta are
    /// retried under the transient policy; once deltas have arrived, a
    /// broken stream finishes with whatever accumulated.
    pub async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        cancel: &CancelToken,
        mut on_partial: impl FnMut(&str) + Send,
    ) -> Result<Option<LlmResult>> {
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1);
                debug!("Retrying LLM stream in {:?} (attempt {})", delay, attempt + 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.consume_stream(&messages, cancel, &mut on_partial).await {
                StreamOutcome::Cancelled => return Ok(None),
                StreamOutcome::Done(result) => return Ok(Some(result)),
                StreamOutcome::ConnectFailed(e) => {
                    if attempt >= MAX_TRANSIENT_RETRIES {
                        return Err(anyhow!("LLM stream failed after {} attempts: {}", attempt + 1, e));
                    }
                    warn!("LLM connect failed: {}", e);
                    attempt += 1;
                }
                StreamOutcome::Rejected(e) => {
                    return Err(anyhow!("LLM request rejected: {}", e));
                }
            }
        }
    }

    async fn consume_stream(
        &self,
        messages: &[ChatMessage],
        cancel: &CancelToken,
        on_partial: &mut (impl FnMut(&str) + Send),
    ) -> StreamOutcome {
        let mut es = match EventSource::new(self.request_builder(messages)) {
            Ok(es) => es,
            Err(e) => return StreamOutcome::ConnectFailed(e.to_string()),
        };

        let mut accumulated = String::new();
        let mut token_count: u64 = 0;
        let mut deltas_since_partial: u32 = 0;
        let mut last_partial = Instant::now();
        let started = Instant::now();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the EventSource aborts the connection rather
                    // than draining it.
                    es.close();
                    return StreamOutcome::Cancelled;
                }
                event = es.next() => event,
            };

            match event {
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) => {
                    if message.data.trim() == "[DONE]" {
                        es.close();
                        break;
                    }
                    let delta = match serde_json::from_str::<StreamResponse>(&message.data) {
                        Ok(parsed) => parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content),
                        Err(e) => {
                            debug!("Skipping unparseable SSE event: {}", e);
                            None
                        }
                    };
                    let Some(delta) = delta else { continue };
                    if delta.is_empty() {
                        continue;
                    }

                    accumulated.push_str(&delta);
                    token_count += 1;
                    deltas_since_partial += 1;

                    if deltas_since_partial >= self.settings.partial_every_deltas
                        && last_partial.elapsed()
                            >= Duration::from_millis(self.settings.partial_min_interval_ms)
                    {
                        on_partial(&accumulated);
                        deltas_since_partial = 0;
                        last_partial = Instant::now();
                    }
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                    es.close();
                    break;
                }
                Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                    let body = response.text().await.unwrap_or_default();
                    es.close();
                    if status.is_server_error() && token_count == 0 {
                        return StreamOutcome::ConnectFailed(format!("LLM returned {}", status));
                    }
                    return StreamOutcome::Rejected(format!("LLM returned {}: {}", status, body));
                }
                Some(Err(e)) => {
                    es.close();
                    if token_count == 0 {
                        return StreamOutcome::ConnectFailed(e.to_string());
                    }
                    // Mid-stream transport loss: finish with what arrived.
                    warn!("LLM stream interrupted after {} deltas: {}", token_count, e);
                    break;
                }
                None => break,
            }
        }

        info!(
            "LLM stream closed: {} deltas, {} chars in {} ms",
            token_count,
            accumulated.len(),
            started.elapsed().as_millis()
        );
        StreamOutcome::Done(LlmResult {
            text: accumulated,
            token_count,
        })
    }
}

enum StreamOutcome {
    Done(LlmResult),
    Cancelled,
    ConnectFailed(String),
    Rejected(String),
}

/// Startup validation, mirroring the ASR stage.
pub fn validate_settings(settings: &LlmSettings) -> Result<()> {
    if settings.max_tokens == 0 {
        anyhow::bail!("LLM max_tokens must be non-zero");
    }
    reqwest::Url::parse(&settings.endpoint)
        .with_context(|| format!("Invalid LLM endpoint: {}", settings.endpoint))?;
    Ok(())
}
