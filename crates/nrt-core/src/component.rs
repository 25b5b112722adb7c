//! Component contracts wired together by the topology runtime.
//!
//! A pipeline is `receiver -> processors -> exporters`. Receivers publish
//! [`Envelope`]s, processors transform [`StageValue`] streams, exporters
//! consume [`Aggregate`]s. Every implementation runs as its own task,
//! consumes its input until it is drained or the root token is cancelled,
//! and closes its output by dropping the sender on return.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{Aggregate, Envelope, StageValue};

/// Channel capacity at pipeline boundaries (receiver outputs, fan-out
/// subscriber inputs, exporter inputs).
pub const PIPELINE_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity between adjacent processor stages. Kept at one so a slow
/// stage exerts back-pressure on its producer immediately.
pub const STAGE_CHANNEL_CAPACITY: usize = 1;

/// Errors that stop a single pipeline or prevent a component from starting.
///
/// Recoverable conditions (undecodable envelopes, late observations,
/// transient export failures) never surface here; they are logged and
/// counted where they occur.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage output closed before input was drained")]
    OutputClosed,

    #[error("pipeline {name}: {source}")]
    Pipeline {
        name: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Produces envelopes until cancelled.
///
/// One instance is started per receiver key referenced by at least one
/// pipeline; its output channel is fanned out to every subscriber.
#[async_trait]
pub trait Receiver: Send {
    async fn start(
        self: Box<Self>,
        shutdown: CancellationToken,
        out: mpsc::Sender<Envelope>,
    ) -> Result<(), PipelineError>;
}

/// Transforms a stream of stage values.
///
/// Implementations must return once `input` closes, must tolerate unexpected
/// variants by dropping them silently, and close their output by dropping
/// `out` on return. Stages that own timers or window state additionally
/// watch `shutdown` so they can flush before closing; pure transforms rely
/// on cancellation reaching them as an upstream closure cascade.
#[async_trait]
pub trait Processor: Send {
    async fn start(
        self: Box<Self>,
        shutdown: CancellationToken,
        input: mpsc::Receiver<StageValue>,
        out: mpsc::Sender<StageValue>,
    ) -> Result<(), PipelineError>;
}

/// Consumes aggregates until `input` closes or `shutdown` is cancelled.
#[async_trait]
pub trait Exporter: Send {
    async fn start(
        self: Box<Self>,
        shutdown: CancellationToken,
        input: mpsc::Receiver<Aggregate>,
    ) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_display_includes_pipeline_name() {
        let err = PipelineError::Pipeline {
            name: "traces".to_string(),
            source: Box::new(PipelineError::OutputClosed),
        };
        assert_eq!(
            err.to_string(),
            "pipeline traces: stage output closed before input was drained"
        );
    }
}
