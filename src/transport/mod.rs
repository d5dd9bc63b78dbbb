//! Transport module
//!
//! Retrying HTTP transport used by the scrape scheduler.

mod client;
mod retry;

pub use client::{parse_base_url, RetryingClient};
pub use retry::{
    RetryPolicy, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF,
    DEFAULT_MAX_RETRIES,
};
