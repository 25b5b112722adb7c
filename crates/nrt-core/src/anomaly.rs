//! Online anomaly scoring for window aggregates.
//!
//! The scorer keeps streaming mean/variance (Welford) statistics per feature
//! over the `(p95, rps, error_rate)` triple and maps the largest absolute
//! z-score of each incoming aggregate through a monotone squash into [0,1].
//! The model learns from the same stream it scores; during warm-up the score
//! is pinned to 0.0 while the statistics still update.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::component::{PipelineError, Processor};
use crate::model::{Aggregate, StageValue};

/// Aggregates observed before scores leave 0.0.
pub const DEFAULT_WARMUP_N: u64 = 32;

const FEATURES: usize = 3;
const MIN_STDDEV: f64 = 1e-9;

/// Streaming mean/variance accumulator.
#[derive(Debug, Clone, Copy, Default)]
struct Welford {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn update(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn stddev(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        (self.m2 / (self.n - 1) as f64).sqrt()
    }
}

/// Attaches an anomaly score in [0,1] to each aggregate.
#[derive(Debug, Clone)]
pub struct AnomalyScorer {
    warmup_n: u64,
    seen: u64,
    stats: [Welford; FEATURES],
}

impl AnomalyScorer {
    pub fn new(warmup_n: u64) -> Self {
        AnomalyScorer {
            warmup_n,
            seen: 0,
            stats: [Welford::default(); FEATURES],
        }
    }

    fn features(a: &Aggregate) -> [f64; FEATURES] {
        [a.p95, a.rps, a.error_rate]
    }

    /// Score against the statistics accumulated so far, then fold the
    /// aggregate into the model.
    fn score_and_update(&mut self, a: &Aggregate) -> f64 {
        let features = Self::features(a);

        let mut z_max = 0.0f64;
        for (stat, &x) in self.stats.iter().zip(features.iter()) {
            let sd = stat.stddev();
            if sd > MIN_STDDEV {
                z_max = z_max.max(((x - stat.mean) / sd).abs());
            }
        }

        for (stat, &x) in self.stats.iter_mut().zip(features.iter()) {
            stat.update(x);
        }
        self.seen += 1;

        if self.seen <= self.warmup_n {
            return 0.0;
        }
        // Monotone squash of the worst z-score: 0 at z=0, ~0.63 at z=3,
        // asymptotically 1.
        1.0 - (-z_max / 3.0).exp()
    }
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        AnomalyScorer::new(DEFAULT_WARMUP_N)
    }
}

#[async_trait]
impl Processor for AnomalyScorer {
    async fn start(
        mut self: Box<Self>,
        _shutdown: CancellationToken,
        mut input: mpsc::Receiver<StageValue>,
        out: mpsc::Sender<StageValue>,
    ) -> Result<(), PipelineError> {
        // Terminates when the input closes, so aggregates flushed upstream
        // during shutdown are still scored and forwarded.
        while let Some(value) = input.recv().await {
            let mut aggregate = match value {
                StageValue::Aggregate(a) => a,
                _ => continue,
            };
            aggregate.anomaly_score = self.score_and_update(&aggregate);
            if out.send(StageValue::Aggregate(aggregate)).await.is_err() {
                return Err(PipelineError::OutputClosed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn aggregate(p95: f64, rps: f64, error_rate: f64) -> Aggregate {
        Aggregate {
            service: "svc".to_string(),
            window_start: 0,
            window_end: 10,
            p50: p95 / 2.0,
            p95,
            p99: p95 * 1.2,
            rps,
            error_rate,
            count: 10,
            labels: HashMap::new(),
            summary_text: String::new(),
            vector: Vec::new(),
            anomaly_score: 0.0,
            locator: "svc@0".to_string(),
        }
    }

    #[test]
    fn warmup_scores_are_zero() {
        let mut scorer = AnomalyScorer::new(5);
        for i in 0..5 {
            let score = scorer.score_and_update(&aggregate(100.0 + i as f64, 10.0, 0.01));
            assert_eq!(score, 0.0, "aggregate {i} should be in warm-up");
        }
        // Model kept learning during warm-up.
        assert_eq!(scorer.seen, 5);
        assert!(scorer.stats[0].stddev() > 0.0);
    }

    #[test]
    fn stable_stream_scores_low_spike_scores_high() {
        let mut scorer = AnomalyScorer::new(8);
        for i in 0..50 {
            scorer.score_and_update(&aggregate(100.0 + (i % 5) as f64, 10.0, 0.01));
        }
        let typical = scorer.score_and_update(&aggregate(102.0, 10.0, 0.01));
        let spike = scorer.score_and_update(&aggregate(900.0, 10.0, 0.9));
        assert!(typical < 0.5, "typical={typical}");
        assert!(spike > typical, "spike={spike} typical={typical}");
        assert!((0.0..=1.0).contains(&spike));
    }

    #[test]
    fn score_is_monotone_in_deviation() {
        let mut base = AnomalyScorer::new(0);
        for _ in 0..100 {
            base.score_and_update(&aggregate(100.0, 10.0, 0.0));
        }
        // Jitter so the variance is non-degenerate.
        for i in 0..20 {
            base.score_and_update(&aggregate(100.0 + (i % 3) as f64, 10.0, 0.0));
        }
        let mut small = base;
        let mut large = small.clone();
        let s_small = small.score_and_update(&aggregate(110.0, 10.0, 0.0));
        let s_large = large.score_and_update(&aggregate(400.0, 10.0, 0.0));
        assert!(s_small < s_large, "small={s_small} large={s_large}");
    }

    #[tokio::test]
    async fn stage_mutates_only_the_score() {
        let shutdown = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let task = tokio::spawn(Box::new(AnomalyScorer::new(0)).start(shutdown, in_rx, out_tx));

        let input = aggregate(120.0, 8.0, 0.25);
        in_tx
            .send(StageValue::Aggregate(input.clone()))
            .await
            .unwrap();
        drop(in_tx);

        let Some(StageValue::Aggregate(scored)) = out_rx.recv().await else {
            panic!("expected aggregate");
        };
        assert!((0.0..=1.0).contains(&scored.anomaly_score));
        assert_eq!(scored.p95, input.p95);
        assert_eq!(scored.rps, input.rps);
        assert_eq!(scored.count, input.count);
        assert_eq!(scored.service, input.service);
        task.await.unwrap().unwrap();
    }
}
