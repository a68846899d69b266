//! Voice Agent - real-time conversational voice-agent server
//!
//! The streaming pipeline coordinator behind a voice agent: per-session
//! audio ingress, sliding-window ASR, token-streaming LLM, sentence-chunked
//! TTS, barge-in with bounded cancellation latency, service health probing,
//! and latency metrics.
//!
//! The media transport (room management, WebRTC) and the three inference
//! services are external; this crate consumes decoded PCM frames and speaks
//! to the providers over their HTTP contracts.

pub mod cli;
pub mod config;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod transport;

// Re-export the types most integrations need.
pub use config::Config;
pub use health::{HealthMonitor, ServiceId, ServiceState};
pub use metrics::MetricsManager;
pub use pipeline::coordinator::{PipelineCoordinator, PipelineError, SessionHandle};
pub use transport::{ClientEvent, MediaTransport, PcmFrame, ServerEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
