//! The HTTP fetcher: size/range probes and streamed ranged/full fetches,
//! with bounded redirect-following and a bounded retry budget.

use crate::error::EngineError;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, RANGE};
use reqwest::{Client, Method, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_REDIRECTS: u8 = 5;

/// Per-request tuning the fetcher applies to every HEAD/GET it issues.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub headers: HeaderMap,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_millis(1000),
            headers: HeaderMap::new(),
        }
    }
}

/// A completed response, plus every `(from, to)` redirect hop observed
/// while fetching it (in hop order).
pub struct FetchOutcome {
    pub response: reqwest::Response,
    pub redirects: Vec<(String, String)>,
}

/// Issues HEAD/GET requests against one mirror at a time. Stateless across
/// calls aside from the retry bookkeeping performed within a single call.
/// `Clone` is cheap: `reqwest::Client` is itself an `Arc` around its
/// connection pool.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    config: FetcherConfig,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(concat!("paradl/", env!("CARGO_PKG_VERSION")))
            // Redirects are followed manually so every hop can be observed
            // and the 5-hop bound enforced explicitly (spec.md 4.1).
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .build()
            .map_err(EngineError::from)?;
        Ok(Self { client, config })
    }

    /// HEAD the URL and return the authoritative `totalSize` from
    /// `Content-Length`. Fails with `SizeUnknown` if absent.
    pub async fn probe_size(&self, url: &str) -> Result<(u64, Vec<(String, String)>), EngineError> {
        let outcome = self
            .with_retries(|| async {
                let outcome = self.request_following_redirects(Method::HEAD, url, None).await?;
                if !outcome.response.status().is_success() {
                    return Err(EngineError::HttpStatus(outcome.response.status().as_u16()));
                }
                Ok(outcome)
            })
            .await?;
        let size = outcome
            .response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(EngineError::SizeUnknown)?;
        Ok((size, outcome.redirects))
    }

    /// HEAD with `Range: bytes=0-0`; true iff the response is 206, plus any
    /// redirect hops observed along the way. Any other outcome, including
    /// network errors, is swallowed to `(false, vec![])`.
    pub async fn probe_range_support(&self, url: &str) -> (bool, Vec<(String, String)>) {
        let result = self
            .request_following_redirects(Method::HEAD, url, Some((0, 0)))
            .await;
        match result {
            Ok(outcome) => (
                outcome.response.status() == StatusCode::PARTIAL_CONTENT,
                outcome.redirects,
            ),
            Err(_) => (false, Vec::new()),
        }
    }

    /// GET `bytes={start}-{end}` (inclusive). The caller drives the
    /// returned response's byte stream and is responsible for back-pressure
    /// (not reading the next chunk until the previous write is durable).
    pub async fn ranged_fetch(
        &self,
        url: &str,
        start: u64,
        end: u64,
        cancel: &AtomicBool,
    ) -> Result<FetchOutcome, EngineError> {
        self.fetch_with_retries(url, Some((start, end)), cancel).await
    }

    /// GET without a Range header, used when the server does not support
    /// ranges (single-stream path).
    pub async fn full_fetch(&self, url: &str, cancel: &AtomicBool) -> Result<FetchOutcome, EngineError> {
        self.fetch_with_retries(url, None, cancel).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        cancel: &AtomicBool,
    ) -> Result<FetchOutcome, EngineError> {
        if cancel.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled);
        }
        let expected = if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        self.with_retries(|| async {
            let outcome = self.request_following_redirects(Method::GET, url, range).await?;
            let status = outcome.response.status();
            if status != expected && !status.is_success() {
                return Err(EngineError::HttpStatus(status.as_u16()));
            }
            Ok(outcome)
        })
        .await
    }

    /// Applies the configured retry budget around `attempt`. Cancellation
    /// is not retried — it is checked once up front by callers that have a
    /// cancel flag; this helper only retries transient fetch failures.
    async fn with_retries<F, Fut>(&self, attempt: F) -> Result<FetchOutcome, EngineError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<FetchOutcome, EngineError>>,
    {
        let mut last_err = None;
        for attempt_num in 0..=self.config.retries {
            match attempt().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(attempt = attempt_num, error = %e, "request attempt failed");
                    last_err = Some(e);
                    if attempt_num < self.config.retries {
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(EngineError::Network("retry budget exhausted".into())))
    }

    async fn request_following_redirects(
        &self,
        method: Method,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<FetchOutcome, EngineError> {
        let mut current = url.to_string();
        let mut redirects = Vec::new();

        for _ in 0..=MAX_REDIRECTS {
            let mut req = self
                .client
                .request(method.clone(), &current)
                .headers(self.config.headers.clone());
            if let Some((start, end)) = range {
                req = req.header(RANGE, HeaderValue::from_str(&format!("bytes={start}-{end}")).unwrap());
            }

            let response = req.send().await.map_err(EngineError::from)?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                if let Some(location) = location {
                    let next = reqwest::Url::parse(&current)
                        .ok()
                        .and_then(|base| base.join(&location).ok())
                        .map(|u| u.to_string())
                        .unwrap_or(location);
                    if next != current {
                        debug!(from = %current, to = %next, "following redirect");
                        redirects.push((current.clone(), next.clone()));
                    }
                    current = next;
                    continue;
                }
            }

            return Ok(FetchOutcome { response, redirects });
        }

        Err(EngineError::Network(format!(
            "exceeded {MAX_REDIRECTS} redirects starting from {url}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_range_support_swallows_network_errors() {
        let fetcher = Fetcher::new(FetcherConfig::default()).unwrap();
        // Unreachable port; the call must resolve to `false`, not an error.
        let (supported, redirects) = fetcher.probe_range_support("http://127.0.0.1:1/nope").await;
        assert!(!supported);
        assert!(redirects.is_empty());
    }

    #[tokio::test]
    async fn fetch_with_retries_respects_cancel_flag() {
        let fetcher = Fetcher::new(FetcherConfig::default()).unwrap();
        let cancel = AtomicBool::new(true);
        let result = fetcher.ranged_fetch("http://127.0.0.1:1/nope", 0, 10, &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
