//! JSON log intake over HTTP.

use async_trait::async_trait;
use hyper::Method;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nrt_core::component::{PipelineError, Receiver};
use nrt_core::model::{Envelope, EnvelopeKind};

/// Accepts `POST /v1/logs` of newline-delimited JSON records.
pub struct JsonLogsReceiver {
    endpoint: String,
}

impl JsonLogsReceiver {
    pub fn new(endpoint: &str) -> Self {
        JsonLogsReceiver {
            endpoint: endpoint.to_string(),
        }
    }
}

fn route(method: &Method, path: &str) -> Option<EnvelopeKind> {
    (method == Method::POST && path == "/v1/logs").then_some(EnvelopeKind::JsonLogs)
}

#[async_trait]
impl Receiver for JsonLogsReceiver {
    async fn start(
        self: Box<Self>,
        shutdown: CancellationToken,
        out: mpsc::Sender<Envelope>,
    ) -> Result<(), PipelineError> {
        super::serve_http("jsonlogs", &self.endpoint, shutdown, out, route).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_only_the_logs_path() {
        assert_eq!(route(&Method::POST, "/v1/logs"), Some(EnvelopeKind::JsonLogs));
        assert_eq!(route(&Method::GET, "/v1/logs"), None);
        assert_eq!(route(&Method::POST, "/v2/logs"), None);
    }
}
