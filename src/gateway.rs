//! Telemetry Gateway
//!
//! Serves one live event stream per request. Every metrics subscriber gets
//! a fresh scraper whose sink is the session's only source; both run under
//! one per-request cancellation token, so when the subscriber leaves the
//! scraper stops as well.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hyper::Response;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{GatewayConfig, SourceConfig};
use crate::error::Result;
use crate::scrape::{Agent, ScrapeTarget};
use crate::stream::{self, ByteSource, EventBody, LineSource, StreamSession};

/// Builds event stream sessions for subscribers
pub struct TelemetryGateway {
    config: GatewayConfig,
    sources: HashMap<String, Arc<dyn ByteSource>>,
    shutdown: CancellationToken,
    active_scrapers: Arc<AtomicUsize>,
}

impl TelemetryGateway {
    /// Create a gateway; sessions are cancelled when `shutdown` fires
    pub fn new(config: GatewayConfig, shutdown: CancellationToken) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sources: HashMap::new(),
            shutdown,
            active_scrapers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Register the configured line sources
    pub fn with_source_configs(mut self, sources: &[SourceConfig]) -> Self {
        for source in sources {
            self = self.with_source(Arc::new(LineSource::from_config(source)));
        }
        self
    }

    /// Register a named byte source
    pub fn with_source(mut self, source: Arc<dyn ByteSource>) -> Self {
        self.sources.insert(source.name().to_string(), source);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn source_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Scrapers of metrics event streams that have not stopped yet
    pub fn active_scrapers(&self) -> usize {
        self.active_scrapers.load(Ordering::SeqCst)
    }

    /// Start a metrics event stream: a new scraper of the gateway target
    /// feeds the returned response body until the subscriber disconnects.
    pub fn metrics_events(&self) -> Result<Response<EventBody>> {
        let session_cancel = self.shutdown.child_token();
        let (sink, source) = mpsc::channel(self.config.sink_capacity);

        let target = ScrapeTarget::from_config(&self.config.target, sink)?;
        let agent = Agent::new(vec![target], self.config.retry)?;
        let (writer, response) = stream::open(self.config.sink_capacity)?;

        let active = self.active_scrapers.clone();
        active.fetch_add(1, Ordering::SeqCst);
        let scraper_cancel = session_cancel.clone();
        tokio::spawn(async move {
            agent.run(scraper_cancel).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
        spawn_session(StreamSession::new(source, writer, session_cancel));

        Ok(response)
    }

    /// Start an event stream over the named source, if it exists
    pub fn source_events(&self, name: &str) -> Option<Result<Response<EventBody>>> {
        let source = self.sources.get(name)?.clone();
        Some(self.open_source(source))
    }

    fn open_source(&self, source: Arc<dyn ByteSource>) -> Result<Response<EventBody>> {
        let session_cancel = self.shutdown.child_token();
        let (sink, rx) = mpsc::channel::<Bytes>(self.config.sink_capacity);
        let (writer, response) = stream::open(self.config.sink_capacity)?;

        let producer_cancel = session_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = source.stream(sink, producer_cancel).await {
                error!("Source {} failed: {}", source.name(), e);
            }
        });
        spawn_session(StreamSession::new(rx, writer, session_cancel));

        Ok(response)
    }
}

fn spawn_session(session: StreamSession) {
    tokio::spawn(async move {
        let id = session.id().to_string();
        if let Err(e) = session.run().await {
            info!("Session {} ended with error: {}", id, e);
        }
    });
}

impl std::fmt::Debug for TelemetryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGateway")
            .field("target", &self.config.target.host)
            .field("sources", &self.source_names())
            .finish()
    }
}
