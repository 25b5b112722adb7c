//! Receiver adapters.
//!
//! Each receiver publishes opaque [`Envelope`]s onto its output channel and
//! returns when the root token is cancelled. The HTTP receivers share the
//! accept-loop plumbing in this module: a `TcpListener` whose connections
//! are served on their own tasks, with a routing function mapping
//! `(method, path)` to the envelope kind an intake endpoint produces.

pub mod jsonlogs;
pub mod otlphttp;
pub mod replay;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nrt_core::component::PipelineError;
use nrt_core::model::{Envelope, EnvelopeKind};

/// Maps an HTTP request to the envelope kind it carries, or `None` for
/// unsupported routes.
type RouteFn = fn(&Method, &str) -> Option<EnvelopeKind>;

/// Accept loop shared by the HTTP receivers. Stops accepting when the root
/// token is cancelled; in-flight connections finish on their own tasks.
pub(crate) async fn serve_http(
    name: &'static str,
    addr: &str,
    shutdown: CancellationToken,
    out: mpsc::Sender<Envelope>,
    route: RouteFn,
) -> Result<(), PipelineError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| PipelineError::Bind {
        addr: addr.to_string(),
        source: e,
    })?;
    info!("[{name}] listening on http://{addr}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("[{name}] stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("[{name}] accept failed: {e}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let out = out.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, out.clone(), route));
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        debug!("[{name}] connection error: {e}");
                    }
                });
            }
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    out: mpsc::Sender<Envelope>,
    route: RouteFn,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let Some(kind) = route(req.method(), req.uri().path()) else {
        return Ok(plain_response(StatusCode::NOT_FOUND, "not found"));
    };
    let body = req.into_body().collect().await?.to_bytes();
    if body.is_empty() {
        return Ok(plain_response(StatusCode::BAD_REQUEST, "empty body"));
    }
    let envelope = Envelope::new(kind, body.to_vec());
    if out.send(envelope).await.is_err() {
        // Pipelines are shutting down; the intake is no longer taking data.
        return Ok(plain_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting down",
        ));
    }
    Ok(plain_response(StatusCode::ACCEPTED, "{}"))
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp
}
