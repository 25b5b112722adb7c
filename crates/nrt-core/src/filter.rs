//! Predicate filtering over aggregates.

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::component::{PipelineError, Processor};
use crate::model::{Aggregate, StageValue};

/// Drops aggregates that fail the configured predicate. Non-matching values
/// disappear silently; everything else passes through untouched.
#[derive(Debug, Clone, Default)]
pub struct FilterStage {
    min_anomaly: Option<f64>,
    service_pattern: Option<Regex>,
}

impl FilterStage {
    pub fn new(min_anomaly: Option<f64>, service_pattern: Option<Regex>) -> Self {
        FilterStage {
            min_anomaly,
            service_pattern,
        }
    }

    fn matches(&self, aggregate: &Aggregate) -> bool {
        if let Some(threshold) = self.min_anomaly {
            if aggregate.anomaly_score < threshold {
                return false;
            }
        }
        if let Some(pattern) = &self.service_pattern {
            if !pattern.is_match(&aggregate.service) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Processor for FilterStage {
    async fn start(
        self: Box<Self>,
        _shutdown: CancellationToken,
        mut input: mpsc::Receiver<StageValue>,
        out: mpsc::Sender<StageValue>,
    ) -> Result<(), PipelineError> {
        while let Some(value) = input.recv().await {
            let aggregate = match value {
                StageValue::Aggregate(a) => a,
                _ => continue,
            };
            if !self.matches(&aggregate) {
                continue;
            }
            if out.send(StageValue::Aggregate(aggregate)).await.is_err() {
                return Err(PipelineError::OutputClosed);
            }
        }
        Ok(())
    }
}
