//! Scrape Scheduler
//!
//! One polling loop per target. Each tick fetches the target's metrics
//! endpoint through the retrying transport and forwards the raw payload to
//! the target's sink. Remote failures are logged and the loop waits for the
//! next tick; only cancellation (or a sink whose receiver is gone) ends it.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ScrapeTargetConfig, MAX_INTERVAL};
use crate::error::{Error, Result};
use crate::telemetry;
use crate::transport::{RetryPolicy, RetryingClient};

/// Sub-path appended to every target's base address
pub const METRICS_PATH: &str = "/metrics";

// =============================================================================
// Scrape Target
// =============================================================================

/// A polled address together with the sink its payloads are sent to
#[derive(Debug, Clone)]
pub struct ScrapeTarget {
    host: String,
    interval: Duration,
    sink: mpsc::Sender<Bytes>,
}

impl ScrapeTarget {
    /// Create a target. The interval must be positive and at most
    /// [`MAX_INTERVAL`].
    pub fn new(
        host: impl Into<String>,
        interval: Duration,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<Self> {
        let host = host.into();
        if interval.is_zero() || interval > MAX_INTERVAL {
            return Err(Error::Config(format!(
                "scrape target {} interval must be positive and at most {:?}, got {:?}",
                host, MAX_INTERVAL, interval
            )));
        }
        Ok(Self {
            host,
            interval,
            sink,
        })
    }

    /// Build from configuration, attaching `sink`
    pub fn from_config(config: &ScrapeTargetConfig, sink: mpsc::Sender<Bytes>) -> Result<Self> {
        config.validate()?;
        Self::new(config.host.clone(), config.interval(), sink)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// =============================================================================
// Scraper
// =============================================================================

/// Why a polling loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeExit {
    /// The cancellation token fired
    Cancelled,
    /// The sink's receiver was dropped
    SinkClosed,
}

/// Polls one target until cancelled
#[derive(Debug)]
pub struct Scraper {
    target: ScrapeTarget,
    client: RetryingClient,
}

impl Scraper {
    pub fn new(target: ScrapeTarget, policy: RetryPolicy) -> Result<Self> {
        let client = RetryingClient::new(target.host.clone(), policy)?;
        Ok(Self { target, client })
    }

    pub fn target(&self) -> &ScrapeTarget {
        &self.target
    }

    /// Run the polling loop until `cancel` fires.
    ///
    /// The first scrape happens one interval after the call. A send to the
    /// sink blocks until the consumer takes the payload or `cancel` fires.
    #[instrument(skip(self, cancel), fields(target = %self.target.host))]
    pub async fn run(&self, cancel: CancellationToken) -> ScrapeExit {
        info!("Starting scraper every {:?}", self.target.interval);

        let mut ticker = interval_at(Instant::now() + self.target.interval, self.target.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Scraper cancelled");
                    return ScrapeExit::Cancelled;
                }
                _ = ticker.tick() => {}
            }

            let payload = match self.client.get(METRICS_PATH, &cancel).await {
                Ok(payload) => {
                    telemetry::metrics().scrapes.with_label_values(&["ok"]).inc();
                    payload
                }
                Err(Error::Cancelled) => {
                    info!("Scraper cancelled during fetch");
                    return ScrapeExit::Cancelled;
                }
                Err(e) => {
                    telemetry::metrics().scrapes.with_label_values(&["error"]).inc();
                    warn!("Failed to scrape {}: {}", self.client.url(METRICS_PATH), e);
                    continue;
                }
            };

            debug!("Scraped {} bytes", payload.len());

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Scraper cancelled while waiting for consumer");
                    return ScrapeExit::Cancelled;
                }
                sent = self.target.sink.send(payload) => {
                    if sent.is_err() {
                        info!("Sink receiver dropped, stopping scraper");
                        return ScrapeExit::SinkClosed;
                    }
                }
            }
        }
    }
}
