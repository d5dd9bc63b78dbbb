//! Scrape module
//!
//! Interval-driven polling of remote metrics endpoints.

mod agent;
mod scheduler;

pub use agent::Agent;
pub use scheduler::{ScrapeExit, ScrapeTarget, Scraper, METRICS_PATH};
