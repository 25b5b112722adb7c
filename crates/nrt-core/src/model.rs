//! Data model shared by every pipeline stage.
//!
//! Three shapes travel through a pipeline: the opaque [`Envelope`] published
//! by receivers, the per-event [`Observation`] produced by the decoders, and
//! the per-window [`Aggregate`] emitted by the summarizer. Between stages
//! they are carried inside the [`StageValue`] tagged variant so that a
//! processor chain can be wired generically while each stage enforces its
//! expected input shape.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Kind tag of a received telemetry payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Metrics,
    Traces,
    Logs,
    JsonLogs,
}

/// A still-serialized telemetry payload on its way from a receiver to the
/// pipelines that subscribe to it.
///
/// The byte buffer is never mutated after publication. When one envelope is
/// fanned out to N pipelines, subscriber 0 receives this buffer and every
/// later subscriber receives an independent copy (see [`Envelope::duplicate`])
/// so concurrent decoders can never race on shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub bytes: Vec<u8>,
    /// Ingress wall-clock timestamp, Unix seconds.
    pub ts_unix: i64,
}

impl Envelope {
    /// Wraps payload bytes with the current wall-clock ingress timestamp.
    pub fn new(kind: EnvelopeKind, bytes: Vec<u8>) -> Self {
        let ts_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);
        Envelope {
            kind,
            bytes,
            ts_unix,
        }
    }

    /// Deep copy handed to fan-out subscribers after the first. The fresh
    /// buffer shares no memory with the original.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Envelope {
            kind: self.kind,
            bytes: self.bytes.clone(),
            ts_unix: self.ts_unix,
        }
    }
}

/// One decoded telemetry event: a latency/error sample for one service.
///
/// An envelope decodes into zero or more observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub service: String,
    pub ts_unix_ms: i64,
    /// Present for span-derived and latency-bearing log observations.
    pub latency_ms: Option<f64>,
    pub is_error: bool,
    /// Number of requests this observation stands for; treated as at least 1.
    pub count: u64,
    pub labels: HashMap<String, String>,
}

/// Identifies one tumbling window of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub service: String,
    /// Window start, Unix seconds, aligned down to the window size.
    pub window_start: i64,
}

impl WindowKey {
    /// Aligns an event timestamp (Unix ms) down to the enclosing window of
    /// `window_secs` seconds.
    pub fn for_timestamp(service: &str, ts_unix_ms: i64, window_secs: i64) -> Self {
        let ts_secs = ts_unix_ms.div_euclid(1000);
        WindowKey {
            service: service.to_string(),
            window_start: ts_secs.div_euclid(window_secs) * window_secs,
        }
    }
}

/// The summary record emitted when a window closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub service: String,
    pub window_start: i64,
    pub window_end: i64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub rps: f64,
    pub error_rate: f64,
    pub count: u64,
    pub labels: HashMap<String, String>,
    /// One-sentence rendering of the window, filled in by the vectorizer.
    pub summary_text: String,
    /// Fixed-dimension embedding, filled in by the vectorizer.
    pub vector: Vec<f32>,
    pub anomaly_score: f64,
    /// Stable pointer back to the source window, `service@window_start`.
    pub locator: String,
}

/// Tagged variant carried on the generic channels between processor stages.
///
/// Each processor consumes the variant it understands and silently drops the
/// rest; only the terminal stage of a pipeline is required to emit
/// [`StageValue::Aggregate`].
#[derive(Debug, Clone)]
pub enum StageValue {
    Envelope(Envelope),
    Observation(Observation),
    Aggregate(Aggregate),
}
