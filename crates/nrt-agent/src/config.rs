//! Agent configuration.
//!
//! A YAML file with four sections: `receivers`, `processors`, `exporters`
//! and `pipelines`. Component entries carry a `type` tag selecting the
//! adapter kind; pipelines reference components by key. Everything is
//! validated up front so that a bad reference or parameter fails the process
//! at startup instead of half-starting a topology.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::exporters::vectorstore::IdTemplate;
use nrt_core::anomaly::DEFAULT_WARMUP_N;
use nrt_core::digest::DEFAULT_COMPRESSION;
use nrt_core::vectorizer::DEFAULT_DIM;

/// Fatal configuration problems. Any of these aborts startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("pipeline {pipeline} references undefined {kind} {key:?}")]
    UnresolvedReference {
        pipeline: String,
        kind: &'static str,
        key: String,
    },

    #[error("pipeline {0} lists no receivers")]
    NoReceivers(String),

    #[error("pipeline {0} lists no processors")]
    NoProcessors(String),

    #[error("pipeline {pipeline}: terminal processor {key:?} cannot emit aggregates")]
    BadTerminalStage { pipeline: String, key: String },

    #[error("exporter {key:?}: invalid id_template: {reason}")]
    InvalidTemplate { key: String, reason: String },

    #[error("processor {key:?}: invalid service_pattern: {source}")]
    InvalidPattern {
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("{component:?}: {field} must be positive")]
    InvalidParameter {
        component: String,
        field: &'static str,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub receivers: HashMap<String, ReceiverConfig>,
    #[serde(default)]
    pub processors: HashMap<String, ProcessorConfig>,
    #[serde(default)]
    pub exporters: HashMap<String, ExporterConfig>,
    #[serde(default)]
    pub pipelines: HashMap<String, PipelineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReceiverConfig {
    /// OTLP-style HTTP intake: `POST /v1/traces` and `POST /v1/metrics`.
    Otlphttp { endpoint: String },
    /// JSON log intake: `POST /v1/logs` of newline-delimited records.
    Jsonlogs { endpoint: String },
    /// Replays a file as a single envelope; local testing aid.
    Replay {
        path: String,
        kind: nrt_core::model::EnvelopeKind,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProcessorConfig {
    Decode,
    Summarizer {
        #[serde(default = "default_window", with = "humantime_serde")]
        window: Duration,
        #[serde(default = "default_grace", with = "humantime_serde")]
        grace: Duration,
        #[serde(default = "default_max_lateness", with = "humantime_serde")]
        max_lateness: Duration,
        #[serde(default = "default_compression")]
        digest_compression: f64,
        #[serde(default = "default_max_labels")]
        max_labels: usize,
    },
    Anomaly {
        #[serde(default = "default_warmup_n")]
        warmup_n: u64,
    },
    Vectorizer {
        #[serde(default = "default_dim")]
        dim: usize,
    },
    Filter {
        #[serde(default)]
        min_anomaly: Option<f64>,
        #[serde(default)]
        service_pattern: Option<String>,
    },
}

impl ProcessorConfig {
    /// Whether a pipeline ending in this stage can produce aggregates.
    pub fn emits_aggregates(&self) -> bool {
        !matches!(self, ProcessorConfig::Decode)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExporterConfig {
    Vectorstore {
        endpoint: String,
        #[serde(default = "default_class")]
        class: String,
        #[serde(default = "default_id_template")]
        id_template: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub exporters: Vec<String>,
}

fn default_window() -> Duration {
    Duration::from_secs(10)
}
fn default_grace() -> Duration {
    Duration::from_secs(2)
}
fn default_max_lateness() -> Duration {
    Duration::from_secs(5)
}
fn default_compression() -> f64 {
    DEFAULT_COMPRESSION
}
fn default_max_labels() -> usize {
    32
}
fn default_warmup_n() -> u64 {
    DEFAULT_WARMUP_N
}
fn default_dim() -> usize {
    DEFAULT_DIM
}
fn default_class() -> String {
    "ServiceWindowSummary".to_string()
}
fn default_id_template() -> String {
    "{service}:{window_start}:{summary_text}".to_string()
}

/// Load and validate a configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let config = parse_config(&content)?;
    info!("configuration loaded from {}", path.display());
    Ok(config)
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    for (key, processor) in &config.processors {
        match processor {
            ProcessorConfig::Summarizer {
                window,
                digest_compression,
                max_labels,
                ..
            } => {
                if window.is_zero() {
                    return Err(invalid(key, "window"));
                }
                if !digest_compression.is_finite() || *digest_compression <= 0.0 {
                    return Err(invalid(key, "digest_compression"));
                }
                if *max_labels == 0 {
                    return Err(invalid(key, "max_labels"));
                }
            }
            ProcessorConfig::Vectorizer { dim } => {
                if *dim == 0 {
                    return Err(invalid(key, "dim"));
                }
            }
            ProcessorConfig::Filter {
                service_pattern, ..
            } => {
                if let Some(pattern) = service_pattern {
                    regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                        key: key.clone(),
                        source: e,
                    })?;
                }
            }
            ProcessorConfig::Decode | ProcessorConfig::Anomaly { .. } => {}
        }
    }

    for (key, exporter) in &config.exporters {
        let ExporterConfig::Vectorstore { id_template, .. } = exporter;
        IdTemplate::parse(id_template).map_err(|reason| ConfigError::InvalidTemplate {
            key: key.clone(),
            reason,
        })?;
    }

    for (name, pipeline) in &config.pipelines {
        if pipeline.receivers.is_empty() {
            return Err(ConfigError::NoReceivers(name.clone()));
        }
        if pipeline.processors.is_empty() {
            return Err(ConfigError::NoProcessors(name.clone()));
        }
        for key in &pipeline.receivers {
            if !config.receivers.contains_key(key) {
                return Err(unresolved(name, "receiver", key));
            }
        }
        for key in &pipeline.processors {
            if !config.processors.contains_key(key) {
                return Err(unresolved(name, "processor", key));
            }
        }
        for key in &pipeline.exporters {
            if !config.exporters.contains_key(key) {
                return Err(unresolved(name, "exporter", key));
            }
        }
        // The terminal stage must be able to emit aggregates.
        if let Some(last) = pipeline.processors.last() {
            if let Some(processor) = config.processors.get(last) {
                if !processor.emits_aggregates() {
                    return Err(ConfigError::BadTerminalStage {
                        pipeline: name.clone(),
                        key: last.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn invalid(key: &str, field: &'static str) -> ConfigError {
    ConfigError::InvalidParameter {
        component: key.to_string(),
        field,
    }
}

fn unresolved(pipeline: &str, kind: &'static str, key: &str) -> ConfigError {
    ConfigError::UnresolvedReference {
        pipeline: pipeline.to_string(),
        kind,
        key: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"
receivers:
  otlp:
    type: otlphttp
    endpoint: "127.0.0.1:4318"
  applogs:
    type: jsonlogs
    endpoint: "127.0.0.1:8088"

processors:
  decode:
    type: decode
  summarize:
    type: summarizer
    window: 10s
    grace: 2s
    max_lateness: 5s
    digest_compression: 100
  score:
    type: anomaly
    warmup_n: 16
  vectorize:
    type: vectorizer
    dim: 8
  anomalous-only:
    type: filter
    min_anomaly: 0.5
    service_pattern: "^payment-"

exporters:
  vectors:
    type: vectorstore
    endpoint: "http://localhost:8080"
    class: ServiceWindowSummary

pipelines:
  traces:
    receivers: [otlp]
    processors: [decode, summarize, score, vectorize]
    exporters: [vectors]
  logs:
    receivers: [applogs]
    processors: [decode, summarize, score, vectorize, anomalous-only]
    exporters: [vectors]
"#;

    #[test]
    fn parses_a_complete_config() {
        let config = parse_config(VALID).unwrap();
        assert_eq!(config.receivers.len(), 2);
        assert_eq!(config.processors.len(), 5);
        assert_eq!(config.pipelines.len(), 2);

        let ProcessorConfig::Summarizer { window, .. } = &config.processors["summarize"] else {
            panic!("expected summarizer");
        };
        assert_eq!(*window, Duration::from_secs(10));
    }

    #[test]
    fn load_config_reads_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.pipelines.len(), 2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_config("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn unknown_component_type_fails_parse() {
        let err = parse_config(
            r#"
receivers:
  k:
    type: carrier-pigeon
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn unresolved_reference_is_rejected() {
        let err = parse_config(
            r#"
processors:
  summarize: {type: summarizer}
pipelines:
  p:
    receivers: [ghost]
    processors: [summarize]
"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::UnresolvedReference { ref key, .. } if key == "ghost"),
            "{err}"
        );
    }

    #[test]
    fn decode_cannot_terminate_a_pipeline() {
        let err = parse_config(
            r#"
receivers:
  r: {type: jsonlogs, endpoint: "127.0.0.1:1"}
processors:
  decode: {type: decode}
pipelines:
  p:
    receivers: [r]
    processors: [decode]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::BadTerminalStage { .. }), "{err}");
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = parse_config(
            r#"
processors:
  s:
    type: summarizer
    window: 0s
"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidParameter { field: "window", .. }),
            "{err}"
        );
    }

    #[test]
    fn bad_service_pattern_is_rejected() {
        let err = parse_config(
            r#"
processors:
  f:
    type: filter
    service_pattern: "["
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }), "{err}");
    }

    #[test]
    fn bad_id_template_is_rejected() {
        let err = parse_config(
            r#"
exporters:
  v:
    type: vectorstore
    endpoint: "http://localhost:8080"
    id_template: "{service}:{no_such_field}"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTemplate { .. }), "{err}");
    }

    #[test]
    fn defaults_fill_optional_summarizer_fields() {
        let config = parse_config(
            r#"
processors:
  s: {type: summarizer}
"#,
        )
        .unwrap();
        let ProcessorConfig::Summarizer {
            window,
            grace,
            max_lateness,
            digest_compression,
            max_labels,
        } = &config.processors["s"]
        else {
            panic!("expected summarizer");
        };
        assert_eq!(*window, Duration::from_secs(10));
        assert_eq!(*grace, Duration::from_secs(2));
        assert_eq!(*max_lateness, Duration::from_secs(5));
        assert_eq!(*digest_compression, DEFAULT_COMPRESSION);
        assert_eq!(*max_labels, 32);
    }
}
