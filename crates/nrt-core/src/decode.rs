//! Envelope payload decoders.
//!
//! Pure functions from envelope bytes to normalized [`Observation`]s, plus
//! the [`DecodeStage`] processor that applies them inside a pipeline. The
//! accepted formats are the normalized serialized shapes produced by the
//! edge adapters:
//!
//! - `Traces`: OTLP/JSON subset (`resourceSpans` -> `scopeSpans` -> `spans`,
//!   with `service.name` in the resource attributes and span status code 2
//!   marking an error);
//! - `Metrics`: a JSON array of `{service, ts_ms, value, count?, error?,
//!   labels?}` samples;
//! - `Logs` / `JsonLogs`: newline-delimited JSON records
//!   `{service?, ts_ms?, level?, latency_ms?, labels?}`.
//!
//! Decode failures never propagate downstream: the stage logs, bumps a
//! counter, and moves on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::component::{PipelineError, Processor};
use crate::model::{Envelope, EnvelopeKind, Observation, StageValue};

/// Per-envelope decode failure; recoverable by policy.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload contained no decodable records")]
    Empty,
}

/// Decode an envelope into zero or more observations.
pub fn decode(env: &Envelope) -> Result<Vec<Observation>, DecodeError> {
    match env.kind {
        EnvelopeKind::Traces => decode_traces(&env.bytes),
        EnvelopeKind::Metrics => decode_metrics(&env.bytes),
        EnvelopeKind::Logs | EnvelopeKind::JsonLogs => decode_log_lines(env),
    }
}

// ---- traces (OTLP/JSON subset) ----

#[derive(Debug, Default, Deserialize)]
struct TraceExport {
    #[serde(default, rename = "resourceSpans")]
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceSpans {
    #[serde(default)]
    resource: Resource,
    #[serde(default, rename = "scopeSpans")]
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Default, Deserialize)]
struct Resource {
    #[serde(default)]
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: AnyValue,
}

#[derive(Debug, Default, Deserialize)]
struct AnyValue {
    #[serde(rename = "stringValue")]
    string_value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ScopeSpans {
    #[serde(default)]
    spans: Vec<Span>,
}

#[derive(Debug, Deserialize)]
struct Span {
    #[serde(default, rename = "startTimeUnixNano", with = "nano_string")]
    start_time_unix_nano: u64,
    #[serde(default, rename = "endTimeUnixNano", with = "nano_string")]
    end_time_unix_nano: u64,
    #[serde(default)]
    status: SpanStatus,
}

#[derive(Debug, Default, Deserialize)]
struct SpanStatus {
    #[serde(default)]
    code: StatusCode,
}

/// OTLP/JSON renders status codes either numerically or as the enum name.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum StatusCode {
    #[default]
    #[serde(skip)]
    Unset,
    Number(i64),
    Name(String),
}

impl StatusCode {
    fn is_error(&self) -> bool {
        match self {
            StatusCode::Unset => false,
            StatusCode::Number(n) => *n == 2,
            StatusCode::Name(s) => s.contains("ERROR"),
        }
    }
}

/// OTLP/JSON encodes 64-bit nanos as decimal strings; tolerate plain numbers
/// as well.
mod nano_string {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrU64 {
        Text(String),
        Number(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
        match StringOrU64::deserialize(de)? {
            StringOrU64::Number(n) => Ok(n),
            StringOrU64::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

fn decode_traces(bytes: &[u8]) -> Result<Vec<Observation>, DecodeError> {
    let export: TraceExport = serde_json::from_slice(bytes)?;
    let mut out = Vec::new();
    for rs in &export.resource_spans {
        let service = rs
            .resource
            .attributes
            .iter()
            .find(|kv| kv.key == "service.name")
            .and_then(|kv| kv.value.string_value.clone())
            .unwrap_or_else(|| "unknown".to_string());
        for ss in &rs.scope_spans {
            for span in &ss.spans {
                let latency_ms = if span.end_time_unix_nano > span.start_time_unix_nano {
                    Some((span.end_time_unix_nano - span.start_time_unix_nano) as f64 / 1e6)
                } else {
                    None
                };
                out.push(Observation {
                    service: service.clone(),
                    ts_unix_ms: (span.start_time_unix_nano / 1_000_000) as i64,
                    latency_ms,
                    is_error: span.status.code.is_error(),
                    count: 1,
                    labels: HashMap::new(),
                });
            }
        }
    }
    Ok(out)
}

// ---- metrics ----

#[derive(Debug, Deserialize)]
struct MetricSample {
    service: String,
    ts_ms: i64,
    value: f64,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    labels: HashMap<String, String>,
}

fn decode_metrics(bytes: &[u8]) -> Result<Vec<Observation>, DecodeError> {
    let samples: Vec<MetricSample> = serde_json::from_slice(bytes)?;
    Ok(samples
        .into_iter()
        .map(|s| {
            let count = s.count.unwrap_or_else(|| s.value.round().max(1.0) as u64);
            Observation {
                service: s.service,
                ts_unix_ms: s.ts_ms,
                latency_ms: None,
                is_error: s.error,
                count: count.max(1),
                labels: s.labels,
            }
        })
        .collect())
}

// ---- logs ----

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    ts_ms: Option<i64>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    latency_ms: Option<f64>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

fn decode_log_lines(env: &Envelope) -> Result<Vec<Observation>, DecodeError> {
    let text = String::from_utf8_lossy(&env.bytes);
    let mut out = Vec::new();
    let mut saw_line = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        saw_line = true;
        let record: LogRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let is_error = record
            .level
            .as_deref()
            .map(|l| {
                let l = l.to_ascii_lowercase();
                l == "error" || l == "fatal" || l == "critical"
            })
            .unwrap_or(false);
        out.push(Observation {
            service: record.service.unwrap_or_else(|| "unknown".to_string()),
            ts_unix_ms: record.ts_ms.unwrap_or(env.ts_unix * 1000),
            latency_ms: record.latency_ms,
            is_error,
            count: 1,
            labels: record.labels,
        });
    }
    if out.is_empty() && saw_line {
        return Err(DecodeError::Empty);
    }
    Ok(out)
}

// ---- processor stage ----

/// Pipeline stage turning envelopes into observations.
pub struct DecodeStage {
    dropped: Arc<AtomicU64>,
}

impl DecodeStage {
    pub fn new() -> Self {
        DecodeStage {
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of envelopes dropped because they would not decode.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl Default for DecodeStage {
    fn default() -> Self {
        DecodeStage::new()
    }
}

#[async_trait]
impl Processor for DecodeStage {
    async fn start(
        self: Box<Self>,
        _shutdown: CancellationToken,
        mut input: mpsc::Receiver<StageValue>,
        out: mpsc::Sender<StageValue>,
    ) -> Result<(), PipelineError> {
        // Terminates when the input closes; root cancellation reaches this
        // stage as a closure cascade from the receiver side.
        while let Some(value) = input.recv().await {
            let env = match value {
                StageValue::Envelope(env) => env,
                _ => continue,
            };
            match decode(&env) {
                Ok(observations) => {
                    for obs in observations {
                        if out.send(StageValue::Observation(obs)).await.is_err() {
                            return Err(PipelineError::OutputClosed);
                        }
                    }
                }
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("dropping undecodable {:?} envelope: {e}", env.kind);
                }
            }
        }
        Ok(())
    }
}
