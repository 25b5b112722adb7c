//! Summary text and embedding generation.
//!
//! For each scored aggregate the vectorizer fills in two derived fields:
//!
//! - `summary_text`, a one-sentence rendering
//!   `"<service> p95=<x>ms rps=<y> err=<z>% anomaly=<a>"` with compact
//!   numbers (integers render bare, fractions with up to two decimals);
//! - `vector`, a fixed-dimension embedding of the numeric fields.
//!
//! The embedding is a pure function of the aggregate: each feature is scaled
//! by a fixed reference constant and damped through `x / (1 + |x|)`, then the
//! six values are cyclically folded into the configured dimension. No online
//! state is involved, so identical aggregates always produce byte-identical
//! vectors.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::component::{PipelineError, Processor};
use crate::model::{Aggregate, StageValue};

/// Default embedding dimension.
pub const DEFAULT_DIM: usize = 8;

/// Fixed reference scales for (p50, p95, p99, rps, error_rate, anomaly_score).
const FEATURE_SCALES: [f64; 6] = [100.0, 250.0, 500.0, 100.0, 1.0, 1.0];

/// Fills `summary_text` and `vector` on each aggregate.
#[derive(Debug, Clone)]
pub struct Vectorizer {
    dim: usize,
}

impl Vectorizer {
    pub fn new(dim: usize) -> Self {
        Vectorizer {
            dim: dim.max(1),
        }
    }

    /// Render the one-sentence summary of an aggregate.
    pub fn summary_text(aggregate: &Aggregate) -> String {
        format!(
            "{} p95={}ms rps={} err={}% anomaly={}",
            aggregate.service,
            fmt_compact(aggregate.p95),
            fmt_compact(aggregate.rps),
            fmt_compact(aggregate.error_rate * 100.0),
            fmt_compact(aggregate.anomaly_score),
        )
    }

    /// Deterministic fixed-dimension embedding of the numeric fields.
    pub fn embed(&self, aggregate: &Aggregate) -> Vec<f32> {
        let features = [
            aggregate.p50,
            aggregate.p95,
            aggregate.p99,
            aggregate.rps,
            aggregate.error_rate,
            aggregate.anomaly_score,
        ];
        let mut vector = vec![0.0f32; self.dim];
        for (i, (&x, &scale)) in features.iter().zip(FEATURE_SCALES.iter()).enumerate() {
            let scaled = x / scale;
            let damped = scaled / (1.0 + scaled.abs());
            vector[i % self.dim] += damped as f32;
        }
        vector
    }

    fn apply(&self, aggregate: &mut Aggregate) {
        aggregate.summary_text = Self::summary_text(aggregate);
        aggregate.vector = self.embed(aggregate);
    }
}

impl Default for Vectorizer {
    fn default() -> Self {
        Vectorizer::new(DEFAULT_DIM)
    }
}

/// Compact numeric rendering: integers bare, otherwise two decimals with
/// trailing zeros trimmed. Non-finite values render as 0.
fn fmt_compact(v: f64) -> String {
    if !v.is_finite() {
        return "0".to_string();
    }
    if (v - v.round()).abs() < 1e-9 {
        return format!("{}", v.round() as i64);
    }
    let s = format!("{v:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[async_trait]
impl Processor for Vectorizer {
    async fn start(
        self: Box<Self>,
        _shutdown: CancellationToken,
        mut input: mpsc::Receiver<StageValue>,
        out: mpsc::Sender<StageValue>,
    ) -> Result<(), PipelineError> {
        // Terminates when the input closes; shutdown reaches this stage as
        // an upstream closure cascade.
        while let Some(value) = input.recv().await {
            let mut aggregate = match value {
                StageValue::Aggregate(a) => a,
                _ => continue,
            };
            self.apply(&mut aggregate);
            if out.send(StageValue::Aggregate(aggregate)).await.is_err() {
                return Err(PipelineError::OutputClosed);
            }
        }
        Ok(())
    }
}
