//! Audio ingress and PCM utilities
//!
//! Receives decoded PCM frames from the transport, normalizes them to
//! 16 kHz mono, and maintains the session's bounded rolling buffer that the
//! ASR windower snapshots. Also home to the PCM helpers the other stages
//! share: RMS energy, in-memory WAV encode/decode, and 20 ms framing.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pipeline::CancelToken;
use crate::transport::PcmFrame;

/// The pipeline's internal sample rate. Optimal for speech models.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Samples per 20 ms outbound frame at 16 kHz.
pub const FRAME_SAMPLES: usize = 320;

/// Bytes per 20 ms outbound frame (PCM16 mono).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Downmix interleaved stereo to mono by signed arithmetic mean.
/// Mono input is returned unchanged.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Resample mono PCM by linear interpolation.
///
/// Quality target is intelligible speech, not musical fidelity. Output
/// length is `ceil(len * to / from)` so cumulative counts stay within one
/// sample of the ideal ratio per chunk.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as u64 * to_rate as u64 + from_rate as u64 - 1)
        / from_rate as u64) as usize;
    let ratio = to_rate as f64 / from_rate as f64;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_floor = idx_floor.min(samples.len() - 1);
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;

        let val = samples[idx_floor] as f32 * (1.0 - frac) + samples[idx_ceil] as f32 * frac;
        out.push(val.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }

    out
}

/// RMS energy of PCM16 samples. Zero for an empty slice.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Encode 16 kHz mono PCM16 samples as an in-memory WAV container.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    Ok(cursor.into_inner())
}

/// Decoded provider audio: PCM16 samples plus their declared layout.
#[derive(Debug, Clone)]
pub struct DecodedWav {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedWav {
    /// Normalize to the pipeline's 16 kHz mono representation.
    pub fn into_pipeline_pcm(self) -> Vec<i16> {
        let mono = downmix_to_mono(&self.samples, self.channels);
        resample_linear(&mono, self.sample_rate, TARGET_SAMPLE_RATE)
    }
}

/// Parse a WAV payload by walking its chunks.
///
/// Streaming synthesis servers emit 0xFFFFFFFF chunk sizes that strict
/// readers reject, so the header is parsed by hand. Supports PCM int16,
/// PCM int32, and IEEE float32 data.
pub fn decode_wav(wav_bytes: &[u8]) -> Result<DecodedWav> {
    if wav_bytes.len() < 44 {
        bail!("WAV data too short: {} bytes", wav_bytes.len());
    }
    if &wav_bytes[0..4] != b"RIFF" || &wav_bytes[8..12] != b"WAVE" {
        bail!("Not a valid WAV payload");
    }

    let mut pos = 12;
    let mut data_start = 0usize;
    let mut data_len = 0usize;
    let mut audio_format = 0u16;
    let mut bits_per_sample = 0u16;
    let mut channels = 1u16;
    let mut sample_rate = 0u32;

    while pos + 8 <= wav_bytes.len() {
        let chunk_id = &wav_bytes[pos..pos + 4];
        let chunk_size = u32::from_le_bytes([
            wav_bytes[pos + 4],
            wav_bytes[pos + 5],
            wav_bytes[pos + 6],
            wav_bytes[pos + 7],
        ]);

        if chunk_id == b"fmt " {
            if pos + 8 + 16 <= wav_bytes.len() {
                audio_format = u16::from_le_bytes([wav_bytes[pos + 8], wav_bytes[pos + 9]]);
                channels = u16::from_le_bytes([wav_bytes[pos + 10], wav_bytes[pos + 11]]);
                sample_rate = u32::from_le_bytes([
                    wav_bytes[pos + 12],
                    wav_bytes[pos + 13],
                    wav_bytes[pos + 14],
                    wav_bytes[pos + 15],
                ]);
                bits_per_sample = u16::from_le_bytes([wav_bytes[pos + 22], wav_bytes[pos + 23]]);
            }
            // Streaming writers leave the size at 0xFFFFFFFF; fmt is 16 bytes for PCM.
            let real_size = if chunk_size == 0xFFFFFFFF { 16 } else { chunk_size as usize };
            pos += 8 + real_size;
        } else if chunk_id == b"data" {
            data_start = pos + 8;
            data_len = if chunk_size == 0xFFFFFFFF {
                wav_bytes.len() - data_start
            } else {
                (chunk_size as usize).min(wav_bytes.len() - data_start)
            };
            break;
        } else {
            let real_size = if chunk_size == 0xFFFFFFFF { 0 } else { chunk_size as usize };
            pos += 8 + real_size;
        }
    }

    if data_start == 0 || data_start >= wav_bytes.len() {
        bail!("Could not find data chunk in WAV");
    }
    if sample_rate == 0 || channels == 0 {
        bail!("WAV fmt chunk missing or malformed");
    }

    let audio_data = &wav_bytes[data_start..data_start + data_len];
    let samples = match (audio_format, bits_per_sample) {
        // IEEE Float32 -> Int16
        (3, _) => audio_data
            .chunks_exact(4)
            .map(|c| {
                let f = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                (f * 32767.0).clamp(-32768.0, 32767.0) as i16
            })
            .collect(),
        (1, 16) => audio_data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
        (1, 32) => audio_data
            .chunks_exact(4)
            .map(|c| {
                let v = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                (v >> 16) as i16
            })
            .collect(),
        (fmt, bits) => bail!("Unsupported WAV layout: format {} / {} bits", fmt, bits),
    };

    Ok(DecodedWav {
        samples,
        sample_rate,
        channels,
    })
}

/// Split 16 kHz mono PCM into 20 ms / 640-byte little-endian frames.
/// The last frame is zero-padded to full length.
pub fn frame_pcm(samples: &[i16]) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(samples.len().div_ceil(FRAME_SAMPLES));
    for chunk in samples.chunks(FRAME_SAMPLES) {
        let mut frame = Vec::with_capacity(FRAME_BYTES);
        for &sample in chunk {
            frame.extend_from_slice(&sample.to_le_bytes());
        }
        frame.resize(FRAME_BYTES, 0);
        frames.push(frame);
    }
    frames
}

/// Bounded ring of the most recent 16 kHz mono samples.
///
/// Written by ingress, snapshotted by the ASR windower. The mutex is held
/// only across append/snapshot; no I/O happens under it.
pub struct RollingBuffer {
    inner: Mutex<VecDeque<i16>>,
    max_samples: usize,
}

impl RollingBuffer {
    pub fn new(max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(max_samples)),
            max_samples,
        }
    }

    /// Append samples, discarding the oldest on overflow.
    pub fn append(&self, samples: &[i16]) {
        let mut buf = self.inner.lock().expect("rolling buffer poisoned");
        for &sample in samples {
            if buf.len() == self.max_samples {
                buf.pop_front();
            }
            buf.push_back(sample);
        }
    }

    /// Copy out the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<i16> {
        let buf = self.inner.lock().expect("rolling buffer poisoned");
        buf.iter().copied().collect()
    }

    /// Copy out at most the newest `n` samples.
    pub fn tail(&self, n: usize) -> Vec<i16> {
        let buf = self.inner.lock().expect("rolling buffer poisoned");
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("rolling buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    pub fn clear(&self) {
        self.inner.lock().expect("rolling buffer poisoned").clear();
    }
}

/// Per-session audio ingress: consumes transport frames, normalizes them,
/// and feeds the rolling buffer.
pub struct AudioIngress {
    buffer: Arc<RollingBuffer>,
    frames_seen: AtomicU64,
    malformed_frames: AtomicU64,
    /// Emit a progress log record every this many frames.
    log_every: u64,
}

impl AudioIngress {
    pub fn new(buffer: Arc<RollingBuffer>, log_every: u64) -> Self {
        Self {
            buffer,
            frames_seen: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            log_every: log_every.max(1),
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen.load(Ordering::Relaxed)
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Normalize one frame into the rolling buffer. Malformed frames are
    /// counted and dropped; ingress never fails the session.
    pub fn ingest(&self, frame: &PcmFrame) {
        if !frame.is_well_formed() {
            let dropped = self.malformed_frames.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Dropping malformed frame #{}: {} samples, {} ch @ {} Hz",
                dropped,
                frame.samples.len(),
                frame.channels,
                frame.sample_rate
            );
            return;
        }

        let mono = downmix_to_mono(&frame.samples, frame.channels);
        let resampled = resample_linear(&mono, frame.sample_rate, TARGET_SAMPLE_RATE);
        self.buffer.append(&resampled);

        let seen = self.frames_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % self.log_every == 0 {
            debug!(
                frames = seen,
                buffer_samples = self.buffer.len(),
                "Audio ingress progress"
            );
        }
    }

    /// Consume frames from the transport channel until the channel closes or
    /// the session is cancelled. Frames arriving after cancellation are
    /// silently discarded by virtue of the task exiting.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<PcmFrame>, cancel: CancelToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => self.ingest(&frame),
                        None => break,
                    }
                }
            }
        }
        debug!(
            frames = self.frames_seen(),
            malformed = self.malformed_frames(),
            "Audio ingress stopped"
        );
    }
}
