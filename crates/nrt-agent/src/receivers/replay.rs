//! File replay receiver.
//!
//! Publishes the contents of a file as a single envelope of the configured
//! kind, then returns. Useful for exercising a full topology from a fixture
//! without standing up an HTTP sender; the closure of its output cascades a
//! flush through the downstream stages.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nrt_core::component::{PipelineError, Receiver};
use nrt_core::model::{Envelope, EnvelopeKind};

pub struct ReplayReceiver {
    path: String,
    kind: EnvelopeKind,
}

impl ReplayReceiver {
    pub fn new(path: &str, kind: EnvelopeKind) -> Self {
        ReplayReceiver {
            path: path.to_string(),
            kind,
        }
    }
}

#[async_trait]
impl Receiver for ReplayReceiver {
    async fn start(
        self: Box<Self>,
        shutdown: CancellationToken,
        out: mpsc::Sender<Envelope>,
    ) -> Result<(), PipelineError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("[replay] cannot read {}: {e}", self.path);
                return Ok(());
            }
        };
        info!("[replay] publishing {} bytes from {}", bytes.len(), self.path);
        let envelope = Envelope::new(self.kind, bytes);
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = out.send(envelope) => {
                if result.is_err() {
                    warn!("[replay] pipelines already stopped");
                }
            }
        }
        Ok(())
    }
}
