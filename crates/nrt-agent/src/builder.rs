//! Config-to-component factories.
//!
//! Each call builds a fresh instance. The topology invokes the processor and
//! exporter factories once per pipeline, so two pipelines naming the same
//! key never share digests, counters or models.

use regex::Regex;

use crate::config::{ConfigError, ExporterConfig, ProcessorConfig, ReceiverConfig};
use crate::exporters::vectorstore::{IdTemplate, VectorStoreExporter};
use crate::receivers::{jsonlogs::JsonLogsReceiver, otlphttp::OtlpHttpReceiver, replay::ReplayReceiver};
use nrt_core::anomaly::AnomalyScorer;
use nrt_core::component::{Exporter, Processor, Receiver};
use nrt_core::decode::DecodeStage;
use nrt_core::filter::FilterStage;
use nrt_core::summarizer::{SummarizerOptions, WindowedSummarizer};
use nrt_core::vectorizer::Vectorizer;

pub fn build_receiver(config: &ReceiverConfig) -> Box<dyn Receiver> {
    match config {
        ReceiverConfig::Otlphttp { endpoint } => Box::new(OtlpHttpReceiver::new(endpoint)),
        ReceiverConfig::Jsonlogs { endpoint } => Box::new(JsonLogsReceiver::new(endpoint)),
        ReceiverConfig::Replay { path, kind } => Box::new(ReplayReceiver::new(path, *kind)),
    }
}

pub fn build_processor(
    key: &str,
    config: &ProcessorConfig,
) -> Result<Box<dyn Processor>, ConfigError> {
    Ok(match config {
        ProcessorConfig::Decode => Box::new(DecodeStage::new()),
        ProcessorConfig::Summarizer {
            window,
            grace,
            max_lateness,
            digest_compression,
            max_labels,
        } => Box::new(WindowedSummarizer::new(SummarizerOptions {
            window: *window,
            grace: *grace,
            max_lateness: *max_lateness,
            digest_compression: *digest_compression,
            max_labels: *max_labels,
        })),
        ProcessorConfig::Anomaly { warmup_n } => Box::new(AnomalyScorer::new(*warmup_n)),
        ProcessorConfig::Vectorizer { dim } => Box::new(Vectorizer::new(*dim)),
        ProcessorConfig::Filter {
            min_anomaly,
            service_pattern,
        } => {
            let pattern = match service_pattern {
                Some(pattern) => {
                    Some(Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                        key: key.to_string(),
                        source: e,
                    })?)
                }
                None => None,
            };
            Box::new(FilterStage::new(*min_anomaly, pattern))
        }
    })
}

pub fn build_exporter(
    key: &str,
    config: &ExporterConfig,
) -> Result<Box<dyn Exporter>, ConfigError> {
    let ExporterConfig::Vectorstore {
        endpoint,
        class,
        id_template,
    } = config;
    let template = IdTemplate::parse(id_template).map_err(|reason| ConfigError::InvalidTemplate {
        key: key.to_string(),
        reason,
    })?;
    Ok(Box::new(VectorStoreExporter::new(endpoint, class, template)))
}
