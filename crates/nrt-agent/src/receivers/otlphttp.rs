//! OTLP-style HTTP intake for traces and metrics.

use async_trait::async_trait;
use hyper::Method;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nrt_core::component::{PipelineError, Receiver};
use nrt_core::model::{Envelope, EnvelopeKind};

/// Accepts `POST /v1/traces` and `POST /v1/metrics`, publishing the payload
/// bytes untouched.
pub struct OtlpHttpReceiver {
    endpoint: String,
}

impl OtlpHttpReceiver {
    pub fn new(endpoint: &str) -> Self {
        OtlpHttpReceiver {
            endpoint: endpoint.to_string(),
        }
    }
}

fn route(method: &Method, path: &str) -> Option<EnvelopeKind> {
    if method != Method::POST {
        return None;
    }
    match path {
        "/v1/traces" => Some(EnvelopeKind::Traces),
        "/v1/metrics" => Some(EnvelopeKind::Metrics),
        _ => None,
    }
}

#[async_trait]
impl Receiver for OtlpHttpReceiver {
    async fn start(
        self: Box<Self>,
        shutdown: CancellationToken,
        out: mpsc::Sender<Envelope>,
    ) -> Result<(), PipelineError> {
        super::serve_http("otlphttp", &self.endpoint, shutdown, out, route).await
    }
}
