//! HTTP fetch utilities for the harvester: cached conditional requests with doubling backoff.

pub mod cache;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use reqwest::header::{ACCEPT, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use cache::{CacheMeta, CachedResponse, ResponseCache};

pub const CRATE_NAME: &str = "statreg-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Every sleep a permanently failing request goes through, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts.max(1) - 1)
            .map(|i| self.delay_for_attempt(i))
            .collect()
    }
}

#[derive(Debug, Error)]
#[error("gave up after {attempts} attempts: {last_error}")]
pub struct RetryExhausted<E> {
    pub attempts: usize,
    pub last_error: E,
}

/// Runs `attempt` until it succeeds or the policy's attempt budget is spent.
///
/// The attempt index (starting at 0) is passed in. There is no sleep after the last attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    mut attempt: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut index = 0usize;
    loop {
        match attempt(index).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                index += 1;
                if index >= max_attempts {
                    return Err(RetryExhausted {
                        attempts: index,
                        last_error: err,
                    });
                }
                let delay = policy.delay_for_attempt(index - 1);
                warn!(
                    attempt = index,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "fetch attempt failed; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            cache_dir: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A single attempt's failure; every variant is retried.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body is not JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("giving up on {url} after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: usize,
        last_error: AttemptError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
struct CacheableRequest {
    method: Method,
    url: String,
    accept: Option<String>,
    form: Vec<(String, String)>,
    key: String,
}

impl CacheableRequest {
    fn new(method: Method, url: &str, accept: Option<&str>, form: &[(&str, &str)]) -> Self {
        let form = form
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>();
        let encoded_body = form
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let method_name = match method {
            Method::Get => "GET",
            Method::Post => "POST",
        };
        Self {
            method,
            url: url.to_string(),
            accept: accept.map(ToString::to_string),
            key: ResponseCache::request_key(method_name, url, encoded_body.as_bytes()),
            form,
        }
    }
}

/// Sequential JSON fetcher: one request in flight, responses cached on disk.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cache: Option<ResponseCache>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            cache: config.cache_dir.map(ResponseCache::new),
            backoff: config.backoff,
        })
    }

    pub async fn get_json(&self, run_id: Uuid, url: &str) -> Result<JsonValue, FetchError> {
        let request = CacheableRequest::new(Method::Get, url, Some("application/json"), &[]);
        self.fetch_with_retry(run_id, request).await
    }

    pub async fn post_form_json(
        &self,
        run_id: Uuid,
        url: &str,
        accept: &str,
        form: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let request = CacheableRequest::new(Method::Post, url, Some(accept), form);
        self.fetch_with_retry(run_id, request).await
    }

    async fn fetch_with_retry(
        &self,
        run_id: Uuid,
        request: CacheableRequest,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", %run_id, url = %request.url);
        let request = &request;
        retry_with_backoff(&self.backoff, move |_| self.fetch_once(request))
            .instrument(span)
            .await
            .map_err(|exhausted| FetchError::Exhausted {
                url: request.url.clone(),
                attempts: exhausted.attempts,
                last_error: exhausted.last_error,
            })
    }

    async fn fetch_once(&self, request: &CacheableRequest) -> Result<JsonValue, AttemptError> {
        let mut cached = self.load_cached(&request.key).await;
        if let Some(entry) = &cached {
            if entry.meta.is_fresh(Utc::now()) {
                debug!(url = %request.url, "serving fresh cached response");
                return Ok(serde_json::from_slice(&entry.body)?);
            }
        }

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url).form(&request.form),
        };
        if let Some(accept) = &request.accept {
            builder = builder.header(ACCEPT, accept);
        }
        if let Some(entry) = &cached {
            if let Some(etag) = &entry.meta.etag {
                builder = builder.header(IF_NONE_MATCH, etag);
            }
            if let Some(since) = entry.meta.if_modified_since() {
                builder = builder.header(IF_MODIFIED_SINCE, since);
            }
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let headers = resp.headers().clone();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached.as_mut() {
                debug!(url = %request.url, "revalidated cached response");
                if let Some(cache) = &self.cache {
                    let refreshed = cache.refresh(&request.key, entry, &headers, Utc::now()).await;
                    if let Err(err) = refreshed {
                        warn!(error = %err, "failed to refresh cache entry");
                    }
                }
                return Ok(serde_json::from_slice(&entry.body)?);
            }
        }

        if status != StatusCode::OK {
            return Err(AttemptError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        let value: JsonValue = serde_json::from_slice(&body)?;

        if let Some(cache) = &self.cache {
            if let Some(meta) = CacheMeta::from_headers(&request.url, &headers, &body, Utc::now()) {
                if let Err(err) = cache.store(&request.key, &meta, &body).await {
                    warn!(error = %err, "failed to store cache entry");
                }
            }
        }
        Ok(value)
    }

    async fn load_cached(&self, key: &str) -> Option<CachedResponse> {
        let cache = self.cache.as_ref()?;
        match cache.load(key).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable cache entry");
                None
            }
        }
    }
}
