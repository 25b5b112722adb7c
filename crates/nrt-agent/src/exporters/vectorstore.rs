//! Vector-store upsert exporter.
//!
//! Writes each aggregate as one object to the store's `POST /v1/objects`
//! endpoint. Object identity is deterministic: the configured `id_template`
//! renders a raw key from the aggregate, and the object ID is the UUID v5
//! (DNS namespace) of that key. Replaying the same aggregate therefore
//! targets the same object, and the store answering 409/422 is treated as
//! success.
//!
//! Transient failures (status >= 300, network errors) are logged and the
//! aggregate is dropped; there is no retry in this path. The exporter walks
//! `Starting -> Running -> Draining -> Stopped`, giving pending work a 10 s
//! ceiling once the input closes or the root is cancelled.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use nrt_core::component::{Exporter, PipelineError};
use nrt_core::model::Aggregate;

/// Outbound request timeout and shutdown drain ceiling.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_CEILING: Duration = Duration::from_secs(10);

/// Aggregate fields an `id_template` may reference.
const TEMPLATE_FIELDS: &[&str] = &[
    "service",
    "window_start",
    "window_end",
    "summary_text",
    "p50",
    "p95",
    "p99",
    "rps",
    "error_rate",
    "anomaly_score",
    "count",
    "locator",
];

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// Parsed `id_template`: literal text interleaved with `{field}`
/// placeholders. `{{field}}` is accepted as an alias for `{field}`.
#[derive(Debug, Clone)]
pub struct IdTemplate {
    segments: Vec<Segment>,
}

impl IdTemplate {
    /// Parse a template, rejecting unknown placeholders and unbalanced
    /// braces with a human-readable reason.
    pub fn parse(template: &str) -> Result<IdTemplate, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            // `{{field}}` and `{field}` are both accepted.
            rest = rest[open..].trim_start_matches('{');
            let Some(close) = rest.find('}') else {
                return Err("unbalanced '{'".to_string());
            };
            let field = &rest[..close];
            if !TEMPLATE_FIELDS.contains(&field) {
                return Err(format!("unknown placeholder {field:?}"));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Field(field.to_string()));
            rest = rest[close..].trim_start_matches('}');
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(IdTemplate { segments })
    }

    fn render(&self, a: &Aggregate) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => out.push_str(&field_value(a, field)),
            }
        }
        out
    }
}

fn field_value(a: &Aggregate, field: &str) -> String {
    match field {
        "service" => a.service.clone(),
        "window_start" => a.window_start.to_string(),
        "window_end" => a.window_end.to_string(),
        "summary_text" => a.summary_text.clone(),
        "p50" => a.p50.to_string(),
        "p95" => a.p95.to_string(),
        "p99" => a.p99.to_string(),
        "rps" => a.rps.to_string(),
        "error_rate" => a.error_rate.to_string(),
        "anomaly_score" => a.anomaly_score.to_string(),
        "count" => a.count.to_string(),
        "locator" => a.locator.clone(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExporterState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Upserts aggregates into a vector store over HTTP.
pub struct VectorStoreExporter {
    endpoint: String,
    class: String,
    id_template: IdTemplate,
    client: reqwest::Client,
}

impl VectorStoreExporter {
    pub fn new(endpoint: &str, class: &str, id_template: IdTemplate) -> Self {
        VectorStoreExporter {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            class: class.to_string(),
            id_template,
            // Long-lived pooled client shared by every upsert.
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Raw identity key of an aggregate: the rendered template, or
    /// `service:window_start` if rendering produced nothing.
    pub fn raw_id(&self, a: &Aggregate) -> String {
        let rendered = self.id_template.render(a);
        if rendered.is_empty() {
            return format!("{}:{}", a.service, a.window_start);
        }
        rendered
    }

    /// Deterministic object ID: UUID v5 over the DNS namespace of the raw
    /// identity key.
    pub fn object_id(&self, a: &Aggregate) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, self.raw_id(a).as_bytes())
    }

    async fn upsert(&self, a: &Aggregate) {
        let id = self.object_id(a);
        // The store schema keeps labels as a flat text field.
        let labels_json =
            serde_json::to_string(&a.labels).unwrap_or_else(|_| "{}".to_string());
        let body = json!({
            "class": self.class,
            "id": id.to_string(),
            "vector": a.vector,
            "properties": {
                "summary": a.summary_text,
                "service": a.service,
                "window_start": a.window_start,
                "window_end": a.window_end,
                "p50": a.p50,
                "p95": a.p95,
                "p99": a.p99,
                "rps": a.rps,
                "error_rate": a.error_rate,
                "anomaly_score": a.anomaly_score,
                "count": a.count,
                "labels": labels_json,
                "locator": a.locator,
            },
        });

        let url = format!("{}/v1/objects", self.endpoint);
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    debug!(service = %a.service, %id, "upserted window aggregate");
                } else if status == StatusCode::CONFLICT
                    || status == StatusCode::UNPROCESSABLE_ENTITY
                {
                    // Object already exists under this deterministic ID.
                    debug!(service = %a.service, %id, "aggregate already stored");
                } else {
                    let text = resp.text().await.unwrap_or_default();
                    warn!(
                        service = %a.service, %status,
                        "vector store rejected aggregate, dropping: {text}"
                    );
                }
            }
            Err(e) => {
                warn!(service = %a.service, "vector store request failed, dropping: {e}");
            }
        }
    }

    /// Consume whatever is still buffered in the input within the drain
    /// ceiling, then stop.
    async fn drain(&self, input: &mut mpsc::Receiver<Aggregate>) {
        let deadline = Instant::now() + DRAIN_CEILING;
        loop {
            let next = tokio::time::timeout_at(deadline, input.recv()).await;
            match next {
                Ok(Some(aggregate)) => {
                    if tokio::time::timeout_at(deadline, self.upsert(&aggregate))
                        .await
                        .is_err()
                    {
                        warn!("drain ceiling hit mid-request, abandoning in-flight upsert");
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    warn!("drain ceiling reached with input still open");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Exporter for VectorStoreExporter {
    async fn start(
        self: Box<Self>,
        shutdown: CancellationToken,
        mut input: mpsc::Receiver<Aggregate>,
    ) -> Result<(), PipelineError> {
        let mut state = ExporterState::Starting;
        debug!(endpoint = %self.endpoint, ?state, "vector store exporter");

        state = ExporterState::Running;
        debug!(?state, "vector store exporter");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                value = input.recv() => match value {
                    Some(aggregate) => self.upsert(&aggregate).await,
                    None => break,
                },
            }
        }

        state = ExporterState::Draining;
        debug!(?state, "vector store exporter");
        self.drain(&mut input).await;

        state = ExporterState::Stopped;
        debug!(?state, "vector store exporter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn aggregate() -> Aggregate {
        Aggregate {
            service: "payment-svc".to_string(),
            window_start: 0,
            window_end: 10,
            p50: 55.0,
            p95: 105.0,
            p99: 108.0,
            rps: 10.0,
            error_rate: 0.15,
            count: 100,
            labels: HashMap::from([("env".to_string(), "prod".to_string())]),
            summary_text: "payment-svc p95=105ms rps=10 err=15% anomaly=0".to_string(),
            vector: vec![0.1, 0.2],
            anomaly_score: 0.0,
            locator: "payment-svc@0".to_string(),
        }
    }

    fn exporter(endpoint: &str) -> VectorStoreExporter {
        let template = IdTemplate::parse("{service}:{window_start}:{summary_text}").unwrap();
        VectorStoreExporter::new(endpoint, "ServiceWindowSummary", template)
    }

    #[test]
    fn template_rejects_unknown_placeholders() {
        assert!(IdTemplate::parse("{service}").is_ok());
        assert!(IdTemplate::parse("{{service}}:{{window_start}}").is_ok());
        assert!(IdTemplate::parse("{bogus}").is_err());
        assert!(IdTemplate::parse("{service").is_err());
    }

    #[test]
    fn raw_id_renders_default_template() {
        let exporter = exporter("http://localhost:9");
        assert_eq!(
            exporter.raw_id(&aggregate()),
            "payment-svc:0:payment-svc p95=105ms rps=10 err=15% anomaly=0"
        );
    }

    #[test]
    fn doubled_braces_render_like_single() {
        let doubled = IdTemplate::parse("{{service}}:{{window_start}}:{{summary_text}}").unwrap();
        let single = IdTemplate::parse("{service}:{window_start}:{summary_text}").unwrap();
        let a = aggregate();
        assert_eq!(doubled.render(&a), single.render(&a));
    }

    #[test]
    fn empty_render_falls_back_to_service_and_window() {
        let template = IdTemplate::parse("").unwrap();
        let exporter = VectorStoreExporter::new("http://localhost:9", "C", template);
        assert_eq!(exporter.raw_id(&aggregate()), "payment-svc:0");
    }

    #[test]
    fn object_id_is_the_rfc4122_v5_uuid() {
        let exporter = exporter("http://localhost:9");
        let id = exporter.object_id(&aggregate());
        assert_eq!(id.to_string(), "6552415a-cbfb-51fd-92e3-153cfce11d8e");
        assert_eq!(id.get_version_num(), 5);
        // Replaying the identical aggregate yields the identical ID.
        assert_eq!(id, exporter.object_id(&aggregate()));
    }

    #[tokio::test]
    async fn upsert_posts_expected_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/objects")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "class": "ServiceWindowSummary",
                "properties": {
                    "service": "payment-svc",
                    "count": 100,
                    "labels": "{\"env\":\"prod\"}",
                    "locator": "payment-svc@0",
                }
            })))
            .with_status(200)
            .create_async()
            .await;

        exporter(&server.url()).upsert(&aggregate()).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn conflict_and_unprocessable_are_idempotent_success() {
        for status in [409, 422] {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("POST", "/v1/objects")
                .with_status(status)
                .expect(2)
                .create_async()
                .await;

            let exporter = Box::new(exporter(&server.url()));
            let shutdown = CancellationToken::new();
            let (tx, rx) = mpsc::channel(8);
            tx.send(aggregate()).await.unwrap();
            tx.send(aggregate()).await.unwrap();
            drop(tx);

            // The exporter finishes cleanly despite the store refusing the
            // duplicate.
            exporter.start(shutdown, rx).await.unwrap();
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn transient_errors_do_not_stop_the_exporter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/objects")
            .with_status(500)
            .with_body("boom")
            .expect(2)
            .create_async()
            .await;

        let exporter = Box::new(exporter(&server.url()));
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        tx.send(aggregate()).await.unwrap();
        tx.send(aggregate()).await.unwrap();
        drop(tx);

        exporter.start(shutdown, rx).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn cancellation_drains_buffered_aggregates() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/objects")
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;

        let exporter = Box::new(exporter(&server.url()));
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        tx.send(aggregate()).await.unwrap();
        shutdown.cancel();
        drop(tx);

        exporter.start(shutdown, rx).await.unwrap();
        mock.assert_async().await;
    }
}
