//! Latency and throughput metrics
//!
//! Each session accumulates per-stage latencies and counters while it runs.
//! On session end the summary is appended as one JSON line to the metrics
//! file, and a rolling window of recent summaries feeds the aggregate
//! report served at `/metrics`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Stage latency budgets in milliseconds; aggregates are reported against
/// these as pass/fail booleans.
pub const ASR_BUDGET_MS: f64 = 500.0;
pub const LLM_BUDGET_MS: f64 = 300.0;
pub const TTS_BUDGET_MS: f64 = 200.0;
pub const E2E_BUDGET_MS: f64 = 1000.0;

/// How many completed-session summaries the rolling window keeps.
const ROLLING_WINDOW: usize = 100;

/// Running min/avg/max over a stream of latency measurements.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencyStat {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl LatencyStat {
    pub fn record(&mut self, ms: f64) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
            self.avg_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
            let n = self.count as f64;
            self.avg_ms = self.avg_ms * n / (n + 1.0) + ms / (n + 1.0);
        }
        self.count += 1;
    }
}

#[derive(Debug, Clone, Default)]
struct StageLatencies {
    asr: LatencyStat,
    llm: LatencyStat,
    tts: LatencyStat,
    e2e: LatencyStat,
}

/// Per-session metrics accumulator. Cheap to record into from any stage.
pub struct SessionMetrics {
    session_id: String,
    started_at: DateTime<Utc>,
    latencies: Mutex<StageLatencies>,
}

impl SessionMetrics {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            latencies: Mutex::new(StageLatencies::default()),
        }
    }

    pub fn record_asr_latency(&self, ms: f64) {
        self.latencies.lock().expect("metrics poisoned").asr.record(ms);
    }

    pub fn record_llm_latency(&self, ms: f64) {
        self.latencies.lock().expect("metrics poisoned").llm.record(ms);
    }

    pub fn record_tts_latency(&self, ms: f64) {
        self.latencies.lock().expect("metrics poisoned").tts.record(ms);
    }

    /// End-to-end: last ASR final to first TTS frame of the response.
    pub fn record_e2e_latency(&self, ms: f64) {
        self.latencies.lock().expect("metrics poisoned").e2e.record(ms);
    }

    /// Freeze the accumulated state into the record written on session end.
    pub fn summarize(&self, counters: CounterTotals) -> SessionSummary {
        let latencies = self.latencies.lock().expect("metrics poisoned").clone();
        let ended_at = Utc::now();
        SessionSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            ended_at,
            duration_secs: (ended_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0,
            asr_chunks: counters.asr_chunks,
            llm_tokens: counters.llm_tokens,
            tts_frames: counters.tts_frames,
            barge_ins: counters.barge_ins,
            errors: counters.errors,
            asr_latency: latencies.asr,
            llm_latency: latencies.llm,
            tts_latency: latencies.tts,
            e2e_latency: latencies.e2e,
        }
    }
}

/// Counter totals captured from the session at summarize time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterTotals {
    pub asr_chunks: u64,
    pub llm_tokens: u64,
    pub tts_frames: u64,
    pub barge_ins: u64,
    pub errors: u64,
}

/// One JSONL record per completed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub asr_chunks: u64,
    pub llm_tokens: u64,
    pub tts_frames: u64,
    pub barge_ins: u64,
    pub errors: u64,
    pub asr_latency: LatencyStat,
    pub llm_latency: LatencyStat,
    pub tts_latency: LatencyStat,
    pub e2e_latency: LatencyStat,
}

/// Aggregate over the rolling window, served at `/metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    pub sessions_completed: u64,
    pub window_size: usize,
    pub total_asr_chunks: u64,
    pub total_llm_tokens: u64,
    pub total_tts_frames: u64,
    pub total_barge_ins: u64,
    pub total_errors: u64,
    pub avg_asr_ms: f64,
    pub avg_llm_ms: f64,
    pub avg_tts_ms: f64,
    pub avg_e2e_ms: f64,
    pub asr_within_budget: bool,
    pub llm_within_budget: bool,
    pub tts_within_budget: bool,
    pub e2e_within_budget: bool,
}

/// Append-only metrics sink plus the in-memory rolling window.
pub struct MetricsManager {
    save_path: PathBuf,
    enabled: bool,
    recent: Mutex<VecDeque<SessionSummary>>,
    sessions_completed: Mutex<u64>,
}

impl MetricsManager {
    pub fn new(save_path: PathBuf, enabled: bool) -> Self {
        Self {
            save_path,
            enabled,
            recent: Mutex::new(VecDeque::with_capacity(ROLLING_WINDOW)),
            sessions_completed: Mutex::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record a completed session: one JSON line appended to the metrics
    /// file (never pruned here) plus the rolling window update.
    pub async fn record_session(&self, summary: SessionSummary) {
        {
            let mut recent = self.recent.lock().expect("metrics window poisoned");
            if recent.len() == ROLLING_WINDOW {
                recent.pop_front();
            }
            recent.push_back(summary.clone());
            *self.sessions_completed.lock().expect("metrics counter poisoned") += 1;
        }

        if !self.enabled {
            return;
        }
        if let Err(e) = self.append_line(&summary).await {
            warn!("Failed to append metrics record: {}", e);
        } else {
            debug!(session = %summary.session_id, "Metrics record written");
        }
    }

    async fn append_line(&self, summary: &SessionSummary) -> Result<()> {
        if let Some(parent) = self.save_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create metrics directory")?;
            }
        }

        let mut line = serde_json::to_string(summary).context("Failed to encode metrics record")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.save_path)
            .await
            .context("Failed to open metrics file")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write metrics record")?;
        file.flush().await.context("Failed to flush metrics file")?;
        Ok(())
    }

    /// Aggregate the rolling window into the `/metrics` report.
    pub fn aggregate(&self) -> AggregateReport {
        let recent = self.recent.lock().expect("metrics window poisoned");
        let completed = *self.sessions_completed.lock().expect("metrics counter poisoned");

        let mut report = AggregateReport {
            sessions_completed: completed,
            window_size: recent.len(),
            total_asr_chunks: 0,
            total_llm_tokens: 0,
            total_tts_frames: 0,
            total_barge_ins: 0,
            total_errors: 0,
            avg_asr_ms: 0.0,
            avg_llm_ms: 0.0,
            avg_tts_ms: 0.0,
            avg_e2e_ms: 0.0,
            asr_within_budget: true,
            llm_within_budget: true,
            tts_within_budget: true,
            e2e_within_budget: true,
        };

        let mut asr = LatencyStat::default();
        let mut llm = LatencyStat::default();
        let mut tts = LatencyStat::default();
        let mut e2e = LatencyStat::default();

        for summary in recent.iter() {
            report.total_asr_chunks += summary.asr_chunks;
            report.total_llm_tokens += summary.llm_tokens;
            report.total_tts_frames += summary.tts_frames;
            report.total_barge_ins += summary.barge_ins;
            report.total_errors += summary.errors;
            merge_stat(&mut asr, &summary.asr_latency);
            merge_stat(&mut llm, &summary.llm_latency);
            merge_stat(&mut tts, &summary.tts_latency);
            merge_stat(&mut e2e, &summary.e2e_latency);
        }

        report.avg_asr_ms = asr.avg_ms;
        report.avg_llm_ms = llm.avg_ms;
        report.avg_tts_ms = tts.avg_ms;
        report.avg_e2e_ms = e2e.avg_ms;
        report.asr_within_budget = asr.count == 0 || asr.avg_ms <= ASR_BUDGET_MS;
        report.llm_within_budget = llm.count == 0 || llm.avg_ms <= LLM_BUDGET_MS;
        report.tts_within_budget = tts.count == 0 || tts.avg_ms <= TTS_BUDGET_MS;
        report.e2e_within_budget = e2e.count == 0 || e2e.avg_ms <= E2E_BUDGET_MS;
        report
    }

    /// Number of summaries currently in the rolling window.
    pub fn window_len(&self) -> usize {
        self.recent.lock().expect("metrics window poisoned").len()
    }
}

fn merge_stat(acc: &mut LatencyStat, other: &LatencyStat) {
    if other.count == 0 {
        return;
    }
    if acc.count == 0 {
        *acc = other.clone();
        return;
    }
    let total = acc.count + other.count;
    acc.avg_ms = (acc.avg_ms * acc.count as f64 + other.avg_ms * other.count as f64) / total as f64;
    acc.min_ms = acc.min_ms.min(other.min_ms);
    acc.max_ms = acc.max_ms.max(other.max_ms);
    acc.count = total;
}

impl Drop for MetricsManager {
    fn drop(&mut self) {
        let completed = self.sessions_completed.lock().map(|c| *c).unwrap_or(0);
        if completed > 0 {
            info!(sessions = completed, "Metrics manager shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary_with_e2e(id: &str, e2e_ms: f64) -> SessionSummary {
        let metrics = SessionMetrics::new(id);
        metrics.record_e2e_latency(e2e_ms);
        metrics.summarize(CounterTotals {
            asr_chunks: 4,
            llm_tokens: 12,
            tts_frames: 50,
            barge_ins: 1,
            errors: 0,
        })
    }

    #[test]
    fn test_latency_stat_running_average() {
        let mut stat = LatencyStat::default();
        stat.record(100.0);
        stat.record(300.0);
        assert_eq!(stat.count, 2);
        assert!((stat.avg_ms - 200.0).abs() < 1e-9);
        assert_eq!(stat.min_ms, 100.0);
        assert_eq!(stat.max_ms, 300.0);
    }

    #[test]
    fn test_session_summary_carries_counters() {
        let summary = summary_with_e2e("s1", 400.0);
        assert_eq!(summary.session_id, "s1");
        assert_eq!(summary.tts_frames, 50);
        assert_eq!(summary.e2e_latency.count, 1);
        assert_eq!(summary.e2e_latency.avg_ms, 400.0);
    }

    #[tokio::test]
    async fn test_jsonl_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let manager = MetricsManager::new(path.clone(), true);

        manager.record_session(summary_with_e2e("a", 100.0)).await;
        manager.record_session(summary_with_e2e("b", 200.0)).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: SessionSummary = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.session_id, "a");
    }

    #[tokio::test]
    async fn test_disabled_manager_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let manager = MetricsManager::new(path.clone(), false);

        manager.record_session(summary_with_e2e("a", 100.0)).await;
        assert!(!path.exists());
        // The rolling window still aggregates.
        assert_eq!(manager.window_len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MetricsManager::new(dir.path().join("m.jsonl"), false);

        manager.record_session(summary_with_e2e("fast", 400.0)).await;
        let report = manager.aggregate();
        assert!(report.e2e_within_budget);
        assert_eq!(report.total_tts_frames, 50);

        manager.record_session(summary_with_e2e("slow", 5000.0)).await;
        let report = manager.aggregate();
        assert!((report.avg_e2e_ms - 2700.0).abs() < 1e-6);
        assert!(!report.e2e_within_budget);
    }

    #[tokio::test]
    async fn test_rolling_window_cap() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MetricsManager::new(dir.path().join("m.jsonl"), false);
        for i in 0..110 {
            manager
                .record_session(summary_with_e2e(&format!("s{}", i), 100.0))
                .await;
        }
        assert_eq!(manager.window_len(), 100);
        assert_eq!(manager.aggregate().sessions_completed, 110);
    }
}
