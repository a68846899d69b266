//! Streaming pipeline
//!
//! Per-session coordination of the three inference stages:
//! Audio Ingress → Streaming ASR → Streaming LLM → Streaming TTS
//!
//! Each stage runs as an independent task owned by the session; the
//! coordinator wires them together with callbacks and bounded queues and
//! handles barge-in by cancelling in-flight work.

pub mod asr;
pub mod audio;
pub mod coordinator;
pub mod llm;
pub mod session;
pub mod tts;

use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;

/// Transient provider failures (5xx, connection reset, timeout) are retried
/// this many times before the stage gives up on the current input.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Exponential backoff with ±20 % jitter: 200 ms base, 2 s cap.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0.8..=1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

/// Cooperative cancellation handle.
///
/// Every long-running pipeline task holds a clone and checks it at each
/// suspension point via `tokio::select!`. Cancellation is a state, not an
/// error: cancelled tasks emit nothing and release their resources.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called. Safe to await repeatedly.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            // The sender lives as long as any clone of the token does; if it
            // is somehow gone, treat that as cancellation.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
