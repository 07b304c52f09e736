//! Block Fetcher Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    fetch::BlockFetcher,
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Largest block body accepted by default (64 MiB).
const DEFAULT_MAX_BLOCK_BYTES: usize = 64 * 1024 * 1024;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Whether to use exponential backoff
    pub use_exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            use_exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        if self.use_exponential_backoff {
            let exponential_delay = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
            exponential_delay.min(self.max_delay)
        } else {
            self.base_delay
        }
    }
}

/// Reqwest-based block fetcher
///
/// Provides:
/// - Connection pooling via reqwest
/// - Automatic retry with exponential backoff on 5xx/429 and transport errors
/// - A size guard so a misbehaving server cannot make the client buffer an
///   unbounded body
pub struct ReqwestBlockFetcher {
    client: Client,
    retry_policy: RetryPolicy,
    max_block_bytes: usize,
}

impl ReqwestBlockFetcher {
    /// Create a fetcher with default timeouts
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a fetcher with a custom request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("media-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client))
    }

    /// Create a fetcher around a preconfigured client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            retry_policy: RetryPolicy::default(),
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_max_block_bytes(mut self, max: usize) -> Self {
        self.max_block_bytes = max;
        self
    }

    /// Perform one GET and read the body under the size guard.
    async fn fetch_once(&self, location: &str) -> Result<Bytes> {
        let response = self.client.get(location).send().await.map_err(|e| {
            if e.is_timeout() {
                BridgeError::OperationFailed("Request timed out".to_string())
            } else if e.is_connect() {
                BridgeError::OperationFailed(format!("Connection failed: {}", e))
            } else {
                BridgeError::OperationFailed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(BridgeError::Http { status });
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_block_bytes {
                return Err(BridgeError::NotAvailable(format!(
                    "Block of {} bytes exceeds limit of {} bytes",
                    len, self.max_block_bytes
                )));
            }
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BridgeError::OperationFailed(e.to_string()))?;
            if body.len() + chunk.len() > self.max_block_bytes {
                return Err(BridgeError::NotAvailable(format!(
                    "Block exceeds limit of {} bytes",
                    self.max_block_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

#[async_trait]
impl BlockFetcher for ReqwestBlockFetcher {
    async fn fetch_block(&self, location: &str) -> Result<Bytes> {
        let policy = &self.retry_policy;
        let mut attempt = 0;
        let mut last_error = None;

        while attempt < policy.max_attempts {
            debug!(
                attempt = attempt + 1,
                max_attempts = policy.max_attempts,
                "Fetching block"
            );

            match self.fetch_once(location).await {
                Ok(body) => {
                    debug!(size = body.len(), "Fetched block");
                    return Ok(body);
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, attempt = attempt + 1, "Block fetch failed with retryable error");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            attempt += 1;

            if attempt < policy.max_attempts {
                let delay = policy.delay_for(attempt);
                debug!(delay_ms = delay.as_millis() as u64, "Retrying after delay");
                sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BridgeError::OperationFailed("All retry attempts exhausted".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            use_exponential_backoff: true,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            use_exponential_backoff: true,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_fetch_block_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/asset/part-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("c2VhbGVkLWJsb2Nr"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = ReqwestBlockFetcher::new().unwrap();
        let body = fetcher
            .fetch_block(&format!("{}/asset/part-1", server.uri()))
            .await
            .unwrap();

        assert_eq!(&body[..], b"c2VhbGVkLWJsb2Nr");
    }

    #[tokio::test]
    async fn test_fetch_block_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = ReqwestBlockFetcher::new()
            .unwrap()
            .with_retry_policy(fast_retry());
        let err = fetcher
            .fetch_block(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Http { status: 404 }));
    }

    #[tokio::test]
    async fn test_fetch_block_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = ReqwestBlockFetcher::new()
            .unwrap()
            .with_retry_policy(fast_retry());
        let err = fetcher
            .fetch_block(&format!("{}/flaky", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Http { status: 503 }));
    }

    #[tokio::test]
    async fn test_fetch_block_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'a'; 64]))
            .mount(&server)
            .await;

        let fetcher = ReqwestBlockFetcher::new()
            .unwrap()
            .with_retry_policy(RetryPolicy::no_retry())
            .with_max_block_bytes(16);
        let err = fetcher
            .fetch_block(&format!("{}/big", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::NotAvailable(_)));
    }
}
