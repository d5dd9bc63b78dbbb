//! HTTP Servers
//!
//! Route tables of the two process modes and the shared accept loop.
//!
//! Agent mode:
//!
//! | Route | Response |
//! |---|---|
//! | `GET /health` | `OK` |
//! | `GET /api/v1/metrics/events` | event stream of scrape payloads |
//! | `GET /api/v1/sources/{name}/events` | event stream of a configured source |
//! | `GET /internal/metrics` | self-metrics, Prometheus text format |
//!
//! Exporter mode:
//!
//! | Route | Response |
//! |---|---|
//! | `GET /metrics` | counter snapshot as JSON, keys ascending |
//! | `GET /health` | `OK` |
//! | `POST /counters/{name}` | increments `{name}`, returns its value |
//!
//! Every exporter request also increments `requests_total`.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::counters::CounterStore;
use crate::error::{Error, Result};
use crate::gateway::TelemetryGateway;
use crate::telemetry;

/// Body type shared by every route
pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// Counter incremented by every exporter request
pub const REQUESTS_COUNTER: &str = "requests_total";

const SOURCES_PREFIX: &str = "/api/v1/sources/";
const EVENTS_SUFFIX: &str = "/events";
const COUNTERS_PREFIX: &str = "/counters/";

// =============================================================================
// Response Helpers
// =============================================================================

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(body.into()).boxed());
    *response.status_mut() = status;
    response
}

fn json(status: StatusCode, value: &serde_json::Value) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = text(status, body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to encode JSON response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn not_found() -> Response<ResponseBody> {
    text(StatusCode::NOT_FOUND, "not found")
}

fn method_not_allowed() -> Response<ResponseBody> {
    text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

/// `{name}` of `{prefix}{name}{suffix}` when it is a single path segment
fn path_param<'a>(path: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let name = path.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(name)
}

// =============================================================================
// Agent Routes
// =============================================================================

/// Route table of the streaming agent
#[derive(Debug, Clone)]
pub struct AgentApi {
    gateway: Arc<TelemetryGateway>,
}

impl AgentApi {
    pub fn new(gateway: Arc<TelemetryGateway>) -> Self {
        Self { gateway }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        self.route(req.method(), req.uri().path())
    }

    fn route(&self, method: &Method, path: &str) -> Response<ResponseBody> {
        if method != Method::GET {
            return method_not_allowed();
        }

        match path {
            "/health" => text(StatusCode::OK, "OK"),
            "/api/v1/metrics/events" => stream_response(self.gateway.metrics_events()),
            "/internal/metrics" => match telemetry::metrics().render() {
                Ok((content_type, body)) => {
                    let mut response = text(StatusCode::OK, body);
                    if let Ok(value) = HeaderValue::from_str(&content_type) {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    error!("{}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                }
            },
            _ => match path_param(path, SOURCES_PREFIX, EVENTS_SUFFIX) {
                Some(name) => match self.gateway.source_events(name) {
                    Some(result) => stream_response(result),
                    None => not_found(),
                },
                None => not_found(),
            },
        }
    }
}

fn stream_response(result: Result<Response<crate::stream::EventBody>>) -> Response<ResponseBody> {
    match result {
        Ok(response) => response.map(|body| body.boxed()),
        Err(e) => {
            error!("Failed to open event stream: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "error opening event stream")
        }
    }
}

// =============================================================================
// Exporter Routes
// =============================================================================

/// Route table of an application exposing its counters
#[derive(Debug, Clone)]
pub struct ExporterApi {
    store: CounterStore,
}

impl ExporterApi {
    pub fn new(store: CounterStore) -> Self {
        store.get_or_create(REQUESTS_COUNTER);
        Self { store }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        self.route(req.method(), req.uri().path())
    }

    fn route(&self, method: &Method, path: &str) -> Response<ResponseBody> {
        self.store.get_or_create(REQUESTS_COUNTER).inc();

        match (method, path) {
            (&Method::GET, "/metrics") => json(StatusCode::OK, &self.store.snapshot_json()),
            (&Method::GET, "/health") => text(StatusCode::OK, "OK"),
            (method, path) if path.starts_with(COUNTERS_PREFIX) => {
                let Some(name) = path_param(path, COUNTERS_PREFIX, "") else {
                    return not_found();
                };
                if method != Method::POST {
                    return method_not_allowed();
                }
                let counter = self.store.get_or_create(name);
                counter.inc();
                json(
                    StatusCode::OK,
                    &serde_json::json!({ "name": name, "value": counter.get() }),
                )
            }
            (_, "/metrics") | (_, "/health") => method_not_allowed(),
            _ => not_found(),
        }
    }
}

// =============================================================================
// Accept Loop
// =============================================================================

/// Serve connections from `listener` until `shutdown` fires.
///
/// Each connection runs on its own task; in-flight connections are not
/// awaited on shutdown.
pub async fn serve<H, Fut>(
    listener: TcpListener,
    shutdown: CancellationToken,
    handler: H,
) -> Result<()>
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<ResponseBody>> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Listening on {}", addr);

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Server on {} shutting down", addr);
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Accept error on {}: {}", addr, e)))?,
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                async move {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    let response = handler(req).await;
                    debug!(%method, %uri, status = response.status().as_u16(), "Request");
                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection from {} closed with error: {}", peer, e);
            }
        });
    }
}

/// Bind `addr` and serve the agent routes
pub async fn run_agent_server(
    addr: &str,
    api: AgentApi,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind(addr).await?;
    serve(listener, shutdown, move |req| {
        let api = api.clone();
        async move { api.handle(req).await }
    })
    .await
}

/// Bind `addr` and serve the exporter routes
pub async fn run_exporter_server(
    addr: &str,
    api: ExporterApi,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind(addr).await?;
    serve(listener, shutdown, move |req| {
        let api = api.clone();
        async move { api.handle(req).await }
    })
    .await
}

async fn bind(addr: &str) -> Result<TcpListener> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid server address {}: {}", addr, e)))?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", addr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, ScrapeTargetConfig};
    use crate::counters::SledBackend;

    fn exporter() -> (ExporterApi, CounterStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SledBackend::open(dir.path()).unwrap();
        let store = CounterStore::with_backend(Box::new(backend)).unwrap();
        (ExporterApi::new(store.clone()), store, dir)
    }

    async fn body_string(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_path_param() {
        assert_eq!(
            path_param("/api/v1/sources/app/events", SOURCES_PREFIX, EVENTS_SUFFIX),
            Some("app")
        );
        assert_eq!(path_param("/api/v1/sources//events", SOURCES_PREFIX, EVENTS_SUFFIX), None);
        assert_eq!(path_param("/api/v1/sources/a/b/events", SOURCES_PREFIX, EVENTS_SUFFIX), None);
        assert_eq!(path_param("/counters/ops", COUNTERS_PREFIX, ""), Some("ops"));
    }

    #[tokio::test]
    async fn test_exporter_counts_requests_and_exposes_snapshot() {
        let (api, store, _dir) = exporter();

        let response = api.route(&Method::POST, "/counters/op1");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"name":"op1","value":1}"#);

        let response = api.route(&Method::GET, "/metrics");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(body_string(response).await, r#"{"op1":1,"requests_total":2}"#);

        assert_eq!(store.value(REQUESTS_COUNTER), Some(2));
    }

    #[tokio::test]
    async fn test_exporter_rejects_bad_methods() {
        let (api, _store, _dir) = exporter();
        assert_eq!(
            api.route(&Method::GET, "/counters/op1").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            api.route(&Method::POST, "/metrics").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(api.route(&Method::GET, "/nope").status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_agent_routes() {
        let config = GatewayConfig {
            target: ScrapeTargetConfig::new("http://127.0.0.1:1", 60),
            ..Default::default()
        };
        let shutdown = CancellationToken::new();
        let gateway = TelemetryGateway::new(config, shutdown.clone()).unwrap();
        let api = AgentApi::new(Arc::new(gateway));

        let response = api.route(&Method::GET, "/health");
        assert_eq!(body_string(response).await, "OK");

        let response = api.route(&Method::GET, "/api/v1/metrics/events");
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");

        assert_eq!(
            api.route(&Method::GET, "/api/v1/sources/missing/events").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            api.route(&Method::POST, "/health").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );

        let response = api.route(&Method::GET, "/internal/metrics");
        assert_eq!(response.status(), StatusCode::OK);

        shutdown.cancel();
    }
}
