//! Topology runtime: wires configured components into running pipelines.
//!
//! Phase 1 starts each referenced receiver exactly once and fans its output
//! out to every subscribing pipeline; phase 2 builds fresh processor and
//! exporter instances per pipeline and spawns one task per stage. Teardown
//! is driven by the root cancellation token: receivers stop publishing,
//! channel closures cascade down the chains, the summarizers flush, and
//! exporters drain within their ceiling. [`run`] returns once every task
//! has joined, surfacing the first pipeline-fatal error if one occurred.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder;
use crate::config::{Config, ConfigError};
use nrt_core::component::{
    PipelineError, PIPELINE_CHANNEL_CAPACITY, STAGE_CHANNEL_CAPACITY,
};
use nrt_core::model::{Aggregate, Envelope, StageValue};

/// Why a topology run ended ahead of a clean shutdown.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Broadcast envelopes from one receiver's shared output to its subscribing
/// pipelines.
///
/// Subscriber 0 receives the original envelope; every later subscriber gets
/// an independent byte copy, so no two pipelines ever decode the same
/// buffer. Delivery is synchronous per subscriber and aborts only on root
/// cancellation. When the shared channel closes the subscriber senders are
/// dropped, which is what closes each pipeline input.
pub async fn fan_out(
    mut shared: mpsc::Receiver<Envelope>,
    subscribers: Vec<mpsc::Sender<Envelope>>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = shared.recv() => match received {
                Some(envelope) => envelope,
                None => return,
            },
        };

        let copies: Vec<Envelope> = (1..subscribers.len())
            .map(|_| envelope.duplicate())
            .collect();
        for (subscriber, item) in subscribers
            .iter()
            .zip(std::iter::once(envelope).chain(copies))
        {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                sent = subscriber.send(item) => {
                    if sent.is_err() {
                        // That pipeline already stopped; the rest still get
                        // their delivery.
                        debug!("fan-out subscriber gone, skipping");
                    }
                }
            }
        }
    }
}

/// Build and run every configured pipeline until the root token is
/// cancelled or every receiver finishes.
pub async fn run(config: &Config, shutdown: CancellationToken) -> Result<(), RunError> {
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Per-pipeline envelope inputs, and which pipelines subscribe to which
    // receiver key.
    let mut pipeline_inputs: HashMap<String, mpsc::Receiver<Envelope>> = HashMap::new();
    let mut receiver_subs: HashMap<String, Vec<mpsc::Sender<Envelope>>> = HashMap::new();
    for (name, pipeline) in &config.pipelines {
        let (tx, rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        pipeline_inputs.insert(name.clone(), rx);
        for key in &pipeline.receivers {
            receiver_subs.entry(key.clone()).or_default().push(tx.clone());
        }
    }

    // ---- Phase 1: one instance per referenced receiver, plus fan-out ----
    for (key, subscribers) in receiver_subs {
        let receiver_config =
            config
                .receivers
                .get(&key)
                .ok_or_else(|| ConfigError::UnresolvedReference {
                    pipeline: String::new(),
                    kind: "receiver",
                    key: key.clone(),
                })?;
        let receiver = builder::build_receiver(receiver_config);
        let (shared_tx, shared_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);

        let receiver_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = receiver.start(receiver_shutdown, shared_tx).await {
                // Receiver failures never abort other pipelines.
                error!("[receiver:{key}] {e}");
            }
        }));
        tasks.push(tokio::spawn(fan_out(
            shared_rx,
            subscribers,
            shutdown.clone(),
        )));
    }

    // ---- Phase 2: per-pipeline stage graphs ----
    let (err_tx, mut err_rx) = mpsc::channel::<PipelineError>(config.pipelines.len().max(1));

    for (name, pipeline) in &config.pipelines {
        info!("[pipeline:{name}] starting");
        let Some(envelope_rx) = pipeline_inputs.remove(name) else {
            continue;
        };

        // Bridge the typed envelope input onto the generic stage channel.
        let (stage_tx, stage_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        tasks.push(tokio::spawn(async move {
            let mut envelope_rx = envelope_rx;
            while let Some(envelope) = envelope_rx.recv().await {
                if stage_tx.send(StageValue::Envelope(envelope)).await.is_err() {
                    return;
                }
            }
        }));

        // Fresh processor instances for this pipeline, one task per stage.
        let mut chain_rx = stage_rx;
        for key in &pipeline.processors {
            let processor_config = config.processors.get(key).ok_or_else(|| {
                ConfigError::UnresolvedReference {
                    pipeline: name.clone(),
                    kind: "processor",
                    key: key.clone(),
                }
            })?;
            let processor = builder::build_processor(key, processor_config)?;
            let (out_tx, out_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

            let stage_shutdown = shutdown.clone();
            let stage_err = err_tx.clone();
            let pipeline_name = name.clone();
            let stage_key = key.clone();
            let stage_input = chain_rx;
            tasks.push(tokio::spawn(async move {
                if let Err(e) = processor.start(stage_shutdown, stage_input, out_tx).await {
                    error!("[pipeline:{pipeline_name}] processor {stage_key} failed: {e}");
                    let _ = stage_err.try_send(PipelineError::Pipeline {
                        name: pipeline_name,
                        source: Box::new(e),
                    });
                }
            }));
            chain_rx = out_rx;
        }

        // Fresh exporter instances, each with its own input channel.
        let mut exporter_inputs: Vec<mpsc::Sender<Aggregate>> = Vec::new();
        for key in &pipeline.exporters {
            let exporter_config = config.exporters.get(key).ok_or_else(|| {
                ConfigError::UnresolvedReference {
                    pipeline: name.clone(),
                    kind: "exporter",
                    key: key.clone(),
                }
            })?;
            let exporter = builder::build_exporter(key, exporter_config)?;
            let (tx, rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
            exporter_inputs.push(tx);

            let exporter_shutdown = shutdown.clone();
            let pipeline_name = name.clone();
            let exporter_key = key.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = exporter.start(exporter_shutdown, rx).await {
                    error!("[pipeline:{pipeline_name}] exporter {exporter_key} failed: {e}");
                }
            }));
        }
        if exporter_inputs.is_empty() {
            warn!("[pipeline:{name}] no exporters; aggregates will be dropped");
        }

        // Terminal bridge: keep only aggregates and broadcast them to every
        // exporter. Runs until the chain closes so shutdown flushes still
        // reach the exporters' drain phase.
        tasks.push(tokio::spawn(async move {
            let mut chain_rx = chain_rx;
            while let Some(value) = chain_rx.recv().await {
                let StageValue::Aggregate(aggregate) = value else {
                    continue;
                };
                for input in &exporter_inputs {
                    if input.send(aggregate.clone()).await.is_err() {
                        debug!("exporter input closed, dropping aggregate copy");
                    }
                }
            }
        }));
    }
    drop(err_tx);

    // Wait for the whole graph to wind down, then surface the first
    // pipeline-fatal error if any was reported.
    for task in tasks {
        let _ = task.await;
    }
    match err_rx.try_recv() {
        Ok(e) => Err(e.into()),
        Err(_) => Ok(()),
    }
}
