//! Metricus - Metrics Scrape Agent and Durable Counters
//!
//! Polls remote metrics endpoints on a fixed interval, republishes the raw
//! payloads as live event streams, and keeps a set of named counters that
//! survive restarts.
//!
//! # Architecture
//!
//! ```text
//! target ─▶ RetryingClient ─▶ Scraper ─▶ sink ─▶ StreamSession ─▶ subscriber
//!
//! Counter::inc ─▶ CounterStore (memory) ─▶ flush ─▶ sled ─▶ load on restart
//! ```
//!
//! # Modules
//!
//! - [`config`] - Configuration values and the agent's YAML file
//! - [`counters`] - Durable counter store
//! - [`error`] - Error types
//! - [`gateway`] - Per-request event stream sessions
//! - [`scrape`] - Interval-driven scrapers
//! - [`server`] - HTTP route tables and accept loop
//! - [`stats`] - Typed container stats payload
//! - [`stream`] - Event stream framing, pump and byte sources
//! - [`telemetry`] - Self-metrics
//! - [`transport`] - Retrying HTTP client

pub mod config;
pub mod counters;
pub mod error;
pub mod gateway;
pub mod scrape;
pub mod server;
pub mod stats;
pub mod stream;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use config::{AgentFileConfig, GatewayConfig, ScrapeTargetConfig, SourceConfig, StoreConfig};
pub use counters::{Counter, CounterStore, FlushReport};
pub use error::{Error, Result};
pub use gateway::TelemetryGateway;
pub use scrape::{Agent, ScrapeTarget, Scraper};
pub use stream::{pump, PumpOutcome, StreamSession};
pub use transport::{RetryPolicy, RetryingClient};
