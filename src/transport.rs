//! Media transport contracts
//!
//! The real-time transport (room management, SFU, WebRTC) lives outside this
//! crate. The pipeline only needs three things from it: decoded PCM frames
//! coming in, two datagram channels going out (reliable and lossy), and an
//! outbound mono audio track. This module defines those seams plus the JSON
//! datagram schema exchanged with the client.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// A decoded PCM frame handed to the pipeline by the transport.
///
/// `samples` is interleaved when `channels == 2`. The transport decides the
/// source rate (commonly 48 kHz); ingress normalizes to 16 kHz mono.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_channel: usize,
}

impl PcmFrame {
    /// A frame is malformed when its sample count does not match the declared
    /// channel layout, or the declared layout itself is nonsense.
    pub fn is_well_formed(&self) -> bool {
        if self.sample_rate == 0 || !(self.channels == 1 || self.channels == 2) {
            return false;
        }
        self.samples.len() == self.samples_per_channel * self.channels as usize
    }
}

/// Server → client datagrams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "asr_partial")]
    AsrPartial { text: String },
    #[serde(rename = "asr_final")]
    AsrFinal { text: String },
    #[serde(rename = "llm_partial")]
    LlmPartial { text: String },
    #[serde(rename = "llm_final")]
    LlmFinal { text: String },
    #[serde(rename = "tts_chunk")]
    TtsChunk { audio: String, segment: u32, frame: u32 },
    #[serde(rename = "agent_interrupted")]
    AgentInterrupted,
}

impl ServerEvent {
    /// Audio chunks ride the lossy channel; everything else must arrive.
    pub fn is_lossy(&self) -> bool {
        matches!(self, ServerEvent::TtsChunk { .. })
    }
}

/// Client → server datagrams (reliable channel).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "barge_in")]
    BargeIn,
}

/// Capabilities the transport supplies for one session.
///
/// Implementations must preserve publish order on the reliable channel.
/// `write_audio_frame` receives 20 ms of 16 kHz mono PCM16 (640 bytes); the
/// transport may upsample for the wire.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn publish_reliable(&self, payload: Vec<u8>) -> Result<()>;
    async fn publish_lossy(&self, payload: Vec<u8>) -> Result<()>;
    async fn write_audio_frame(&self, pcm: Vec<u8>) -> Result<()>;
    /// Called exactly once when the session is reclaimed.
    fn release(&self);
}

/// Serializes [`ServerEvent`]s and routes them to the right channel.
///
/// Publish failures are logged and swallowed: a flaky datagram channel must
/// not tear down a stage (stage-local error policy).
#[derive(Clone)]
pub struct EventPublisher {
    session_id: String,
    transport: Arc<dyn MediaTransport>,
}

impl EventPublisher {
    pub fn new(session_id: impl Into<String>, transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            session_id: session_id.into(),
            transport,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transport(&self) -> &Arc<dyn MediaTransport> {
        &self.transport
    }

    pub async fn publish(&self, event: ServerEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(session = %self.session_id, "Failed to encode event: {}", e);
                return;
            }
        };

        let result = if event.is_lossy() {
            self.transport.publish_lossy(payload).await
        } else {
            self.transport.publish_reliable(payload).await
        };

        if let Err(e) = result {
            warn!(session = %self.session_id, "Datagram publish failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_event_wire_shape() {
        let json = serde_json::to_string(&ServerEvent::AsrPartial {
            text: "hello".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"asr_partial","text":"hello"}"#);

        let json = serde_json::to_string(&ServerEvent::AgentInterrupted).unwrap();
        assert_eq!(json, r#"{"type":"agent_interrupted"}"#);

        let json = serde_json::to_string(&ServerEvent::TtsChunk {
            audio: "AAAA".to_string(),
            segment: 1,
            frame: 2,
        })
        .unwrap();
        assert!(json.contains(r#""type":"tts_chunk""#));
        assert!(json.contains(r#""segment":1"#));
    }

    #[test]
    fn test_client_event_parse() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"barge_in"}"#).unwrap();
        assert_eq!(event, ClientEvent::BargeIn);

        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"unknown"}"#).is_err());
        assert!(serde_json::from_str::<ClientEvent>("not json").is_err());
    }

    #[test]
    fn test_lossy_routing() {
        assert!(ServerEvent::TtsChunk {
            audio: String::new(),
            segment: 1,
            frame: 1
        }
        .is_lossy());
        assert!(!ServerEvent::AsrFinal {
            text: String::new()
        }
        .is_lossy());
        assert!(!ServerEvent::AgentInterrupted.is_lossy());
    }

    #[test]
    fn test_frame_well_formed() {
        let frame = PcmFrame {
            samples: vec![0i16; 960],
            sample_rate: 48000,
            channels: 2,
            samples_per_channel: 480,
        };
        assert!(frame.is_well_formed());

        let bad = PcmFrame {
            samples: vec![0i16; 100],
            sample_rate: 48000,
            channels: 2,
            samples_per_channel: 480,
        };
        assert!(!bad.is_well_formed());

        let bad_channels = PcmFrame {
            samples: vec![0i16; 480 * 3],
            sample_rate: 48000,
            channels: 3,
            samples_per_channel: 480,
        };
        assert!(!bad_channels.is_well_formed());
    }
}
