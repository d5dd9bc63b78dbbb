//! Retrying HTTP Client
//!
//! Executes a single logical request against a pre-bound base address,
//! retrying transport failures and 5xx/429 answers with capped exponential
//! backoff. Other 4xx answers end the request immediately.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode, Url};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::retry::RetryPolicy;
use crate::error::{Error, Result};

/// Longest error body kept in `Error::ClientStatus`
const MAX_ERROR_BODY: usize = 512;

/// Parse a base address. Only absolute `http`/`https` URLs with a host are
/// accepted.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::InvalidRequest(format!("invalid base address {:?}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        scheme => Err(Error::InvalidRequest(format!(
            "base address {:?} needs an http(s) scheme and a host, got scheme {:?}",
            raw, scheme
        ))),
    }
}

/// Failure to send a request. Builder errors mean the request itself is
/// malformed and are never retried.
fn send_error(source: reqwest::Error, attempts: u32) -> Error {
    if source.is_builder() {
        Error::InvalidRequest(format!("cannot build request: {}", source))
    } else {
        Error::Network { source, attempts }
    }
}

/// HTTP client bound to one base address with a retry policy
#[derive(Clone)]
pub struct RetryingClient {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

impl RetryingClient {
    /// Create a client for `base_url`, which must be an absolute
    /// `http`/`https` address
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::InvalidRequest("base address is empty".into()));
        }
        parse_base_url(&base_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(policy.attempt_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            policy,
        })
    }

    /// Base address every path is appended to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Full URL for `path`
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// GET `path` with retries
    pub async fn get(&self, path: &str, cancel: &CancellationToken) -> Result<Bytes> {
        self.execute(Method::GET, path, cancel).await
    }

    /// Execute `method path`, retrying per the policy.
    ///
    /// Returns the body of the first 2xx answer. Cancellation is observed
    /// both during an attempt and during a backoff wait.
    #[instrument(skip(self, cancel), fields(base = %self.base_url))]
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let url = self.url(path);
        let mut retry = 0u32;

        loop {
            let attempts = retry + 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = self.attempt(method.clone(), &url, attempts) => outcome,
            };

            match outcome {
                Ok(body) => {
                    debug!("{} {} succeeded after {} attempt(s)", method, url, attempts);
                    return Ok(body);
                }
                Err(e) if e.is_retryable() && retry < self.policy.max_retries => {
                    let wait = self.policy.backoff(retry);
                    warn!(
                        "{} {} failed (attempt {}): {}; retrying in {:?}",
                        method, url, attempts, e, wait
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(wait) => {}
                    }
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, method: Method, url: &str, attempts: u32) -> Result<Bytes> {
        let response = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(|source| send_error(source, attempts))?;

        let status = response.status();
        if status.is_success() {
            return response
                .bytes()
                .await
                .map_err(|source| Error::Network { source, attempts });
        }

        if RetryPolicy::is_retryable_status(status.as_u16()) {
            return Err(Error::ServerStatus {
                status: status.as_u16(),
                attempts,
            });
        }

        Err(Error::ClientStatus {
            status: status.as_u16(),
            body: error_body(response, status).await,
        })
    }
}

async fn error_body(response: reqwest::Response, status: StatusCode) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    if body.is_empty() {
        body = status.canonical_reason().unwrap_or("").to_string();
    }
    body
}

impl std::fmt::Debug for RetryingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingClient")
            .field("base_url", &self.base_url)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
            .with_attempt_timeout(Duration::from_millis(500))
    }

    #[test]
    fn test_url_joining() {
        let client = RetryingClient::new("http://app:8080/", fast_policy()).unwrap();
        assert_eq!(client.base_url(), "http://app:8080");
        assert_eq!(client.url("/metrics"), "http://app:8080/metrics");
        assert_eq!(client.url("metrics"), "http://app:8080/metrics");
    }

    #[test]
    fn test_empty_base_rejected() {
        assert_matches!(
            RetryingClient::new("", fast_policy()),
            Err(Error::InvalidRequest(_))
        );
    }

    #[test]
    fn test_base_without_scheme_rejected() {
        for base in ["example_client:8080", "localhost:8080", "app", "ftp://app"] {
            assert_matches!(
                RetryingClient::new(base, fast_policy()),
                Err(Error::InvalidRequest(_)),
                "{}",
                base
            );
        }
        assert!(parse_base_url("http://example_client:8080").is_ok());
    }

    #[test]
    fn test_builder_error_is_not_retried() {
        let source = Client::new().get("http://[::1").build().unwrap_err();
        assert!(source.is_builder());

        let err = send_error(source, 1);
        assert_matches!(err, Error::InvalidRequest(_));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_exhausts_budget() {
        let client = RetryingClient::new("http://127.0.0.1:1", fast_policy()).unwrap();
        let result = client.get("/metrics", &CancellationToken::new()).await;

        assert_matches!(result, Err(Error::Network { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_secs(60), Duration::from_secs(60))
            .with_attempt_timeout(Duration::from_millis(500));
        let client = RetryingClient::new("http://127.0.0.1:1", policy).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = client.get("/metrics", &cancel).await;
        assert_matches!(result, Err(Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
