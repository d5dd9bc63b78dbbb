//! Self-metrics
//!
//! Prometheus counters describing the agent's own activity, kept in a
//! dedicated registry and exposed in text format on `/internal/metrics`.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Agent self-metrics
pub struct SelfMetrics {
    registry: Registry,

    /// Scrape attempts by outcome (`ok`, `error`)
    pub scrapes: IntCounterVec,

    /// Per-counter backend writes by outcome (`ok`, `error`)
    pub flush_writes: IntCounterVec,

    /// Event frames written to subscribers
    pub stream_frames: IntCounter,

    /// Stream sessions opened
    pub stream_sessions: IntCounter,
}

impl SelfMetrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let scrapes = IntCounterVec::new(
            Opts::new("metricus_scrapes_total", "Scrape cycles by outcome"),
            &["outcome"],
        )?;
        let flush_writes = IntCounterVec::new(
            Opts::new(
                "metricus_flush_writes_total",
                "Counter writes to the durable backend by outcome",
            ),
            &["outcome"],
        )?;
        let stream_frames = IntCounter::new(
            "metricus_stream_frames_total",
            "Event frames written to subscribers",
        )?;
        let stream_sessions = IntCounter::new(
            "metricus_stream_sessions_total",
            "Event stream sessions opened",
        )?;

        registry.register(Box::new(scrapes.clone()))?;
        registry.register(Box::new(flush_writes.clone()))?;
        registry.register(Box::new(stream_frames.clone()))?;
        registry.register(Box::new(stream_sessions.clone()))?;

        Ok(Self {
            registry,
            scrapes,
            flush_writes,
            stream_frames,
            stream_sessions,
        })
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

static METRICS: Lazy<SelfMetrics> =
    Lazy::new(|| SelfMetrics::new().expect("self-metric definitions are valid and unique"));

/// Process-wide self-metrics
pub fn metrics() -> &'static SelfMetrics {
    &METRICS
}
