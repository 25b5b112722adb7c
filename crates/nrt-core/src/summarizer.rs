//! Per-service tumbling-window aggregation.
//!
//! The summarizer owns a map of open windows keyed by
//! `(service, window_start)`. Observations update the window's latency
//! digest and request/error counters; a background tick (every quarter
//! window) emits and deletes windows whose grace period has passed.
//! Observations arriving after `window_end + max_lateness` are dropped and
//! counted, never applied.
//!
//! Ordering: aggregates emitted on one tick are sorted by
//! `(window_start, service)`. On cancellation or input closure every
//! remaining window is flushed exactly once, then the output closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::component::{PipelineError, Processor};
use crate::digest::{LatencyDigest, DEFAULT_COMPRESSION};
use crate::model::{Aggregate, Observation, StageValue, WindowKey};

/// Tuning knobs for one summarizer instance.
#[derive(Debug, Clone)]
pub struct SummarizerOptions {
    /// Tumbling window size.
    pub window: Duration,
    /// Extra wall-clock slack before a closed window is emitted.
    pub grace: Duration,
    /// Observations older than `window_end + max_lateness` are dropped.
    pub max_lateness: Duration,
    /// Compression of the per-window latency digest.
    pub digest_compression: f64,
    /// Cap on distinct label keys retained per window.
    pub max_labels: usize,
}

impl Default for SummarizerOptions {
    fn default() -> Self {
        SummarizerOptions {
            window: Duration::from_secs(10),
            grace: Duration::from_secs(2),
            max_lateness: Duration::from_secs(5),
            digest_compression: DEFAULT_COMPRESSION,
            max_labels: 32,
        }
    }
}

/// Accumulated state of one open window.
#[derive(Debug)]
struct WindowState {
    latency_digest: LatencyDigest,
    req_count: u64,
    err_count: u64,
    labels: HashMap<String, String>,
    first_ts: i64,
    last_ts: i64,
}

/// The windowed summarization stage. One instance per pipeline; its window
/// map is owned by the stage task and never shared.
pub struct WindowedSummarizer {
    opts: SummarizerOptions,
    clock: Clock,
    windows: HashMap<WindowKey, WindowState>,
    lateness_dropped: Arc<AtomicU64>,
}

impl WindowedSummarizer {
    pub fn new(opts: SummarizerOptions) -> Self {
        WindowedSummarizer::with_clock(opts, Clock::System)
    }

    /// Construct with an explicit clock; tests pin the wall clock to drive
    /// the lateness and emission policies deterministically.
    pub fn with_clock(opts: SummarizerOptions, clock: Clock) -> Self {
        WindowedSummarizer {
            opts,
            clock,
            windows: HashMap::new(),
            lateness_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of observations dropped by the lateness policy.
    pub fn lateness_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.lateness_dropped)
    }

    fn window_secs(&self) -> i64 {
        (self.opts.window.as_secs() as i64).max(1)
    }

    /// Apply one observation, creating its window on first sight. Late
    /// observations are counted and dropped; malformed ones are skipped.
    fn observe(&mut self, obs: Observation) {
        if obs.service.is_empty() {
            trace!("skipping observation without a service");
            return;
        }
        let window_secs = self.window_secs();
        let key = WindowKey::for_timestamp(&obs.service, obs.ts_unix_ms, window_secs);
        let window_end = key.window_start + window_secs;

        let now = self.clock.now_unix();
        if now > window_end + self.opts.max_lateness.as_secs() as i64 {
            self.lateness_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(
                service = %obs.service,
                window_start = key.window_start,
                "dropping late observation"
            );
            return;
        }

        let state = self.windows.entry(key).or_insert_with(|| WindowState {
            latency_digest: LatencyDigest::new(self.opts.digest_compression),
            req_count: 0,
            err_count: 0,
            labels: HashMap::new(),
            first_ts: obs.ts_unix_ms,
            last_ts: obs.ts_unix_ms,
        });

        if let Some(latency) = obs.latency_ms {
            state.latency_digest.insert(latency);
        }
        let effective = obs.count.max(1);
        state.req_count += effective;
        if obs.is_error {
            state.err_count += effective;
        }
        for (k, v) in obs.labels {
            // Last writer wins for known keys; new keys beyond the cap are
            // dropped.
            if state.labels.contains_key(&k) || state.labels.len() < self.opts.max_labels {
                state.labels.insert(k, v);
            }
        }
        state.first_ts = state.first_ts.min(obs.ts_unix_ms);
        state.last_ts = state.last_ts.max(obs.ts_unix_ms);
    }

    /// Emit every window whose grace period has expired.
    async fn emit_closed(&mut self, out: &mpsc::Sender<StageValue>) -> Result<(), PipelineError> {
        let now = self.clock.now_unix();
        let window_secs = self.window_secs();
        let grace = self.opts.grace.as_secs() as i64;
        let expired: Vec<WindowKey> = self
            .windows
            .keys()
            .filter(|k| k.window_start + window_secs + grace < now)
            .cloned()
            .collect();
        self.emit_keys(expired, out).await
    }

    /// Emit every remaining window, partial or not. Runs once at shutdown.
    async fn flush_all(&mut self, out: &mpsc::Sender<StageValue>) -> Result<(), PipelineError> {
        let keys: Vec<WindowKey> = self.windows.keys().cloned().collect();
        let remaining = keys.len();
        if remaining > 0 {
            debug!("flushing {remaining} open window(s) on shutdown");
        }
        self.emit_keys(keys, out).await
    }

    async fn emit_keys(
        &mut self,
        mut keys: Vec<WindowKey>,
        out: &mpsc::Sender<StageValue>,
    ) -> Result<(), PipelineError> {
        keys.sort_by(|a, b| {
            (a.window_start, a.service.as_str()).cmp(&(b.window_start, b.service.as_str()))
        });
        for key in keys {
            if let Some(state) = self.windows.remove(&key) {
                let aggregate = self.build_aggregate(&key, state);
                if out.send(StageValue::Aggregate(aggregate)).await.is_err() {
                    return Err(PipelineError::OutputClosed);
                }
            }
        }
        Ok(())
    }

    fn build_aggregate(&self, key: &WindowKey, mut state: WindowState) -> Aggregate {
        let window_secs = self.window_secs();
        let window_end = key.window_start + window_secs;
        let error_rate = if state.req_count == 0 {
            0.0
        } else {
            (state.err_count as f64 / state.req_count as f64).clamp(0.0, 1.0)
        };
        Aggregate {
            service: key.service.clone(),
            window_start: key.window_start,
            window_end,
            p50: state.latency_digest.quantile(0.50),
            p95: state.latency_digest.quantile(0.95),
            p99: state.latency_digest.quantile(0.99),
            rps: state.req_count as f64 / window_secs as f64,
            error_rate,
            count: state.req_count,
            labels: state.labels,
            summary_text: String::new(),
            vector: Vec::new(),
            anomaly_score: 0.0,
            locator: format!("{}@{}", key.service, key.window_start),
        }
    }
}

#[async_trait]
impl Processor for WindowedSummarizer {
    async fn start(
        mut self: Box<Self>,
        shutdown: CancellationToken,
        mut input: mpsc::Receiver<StageValue>,
        out: mpsc::Sender<StageValue>,
    ) -> Result<(), PipelineError> {
        let tick_period = self.opts.window / 4;
        let mut tick = tokio::time::interval(tick_period.max(Duration::from_millis(250)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush_all(&out).await?;
                    return Ok(());
                }
                _ = tick.tick() => {
                    self.emit_closed(&out).await?;
                }
                value = input.recv() => match value {
                    Some(StageValue::Observation(obs)) => self.observe(obs),
                    Some(_) => {}
                    None => {
                        self.flush_all(&out).await?;
                        return Ok(());
                    }
                },
            }
        }
    }
}
