use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::FetchPolicy;
use crate::domain::{Period, Target};
use crate::error::BackfillError;
use crate::providers::Provider;
use crate::rate_limit::Sleeper;

/// Upper bound on pages for one unit, guarding against a provider that never stops paginating.
pub const MAX_PAGES_PER_UNIT: usize = 50;

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Copy of this request with `key` replaced (or appended).
    pub fn with_query(&self, key: &str, value: impl ToString) -> Self {
        let mut next = self.clone();
        match next.query.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => next.query.push((key.to_string(), value.to_string())),
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// One blocking HTTP GET.
pub trait Transport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).get(request)
    }
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, BackfillError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("wx-backfill/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BackfillError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| BackfillError::HttpClient(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        let response = builder.send().map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify)?;
        Ok(HttpResponse { status, body })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

/// Unparsed provider response bodies for one unit, one per page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPayload {
    pub pages: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("circuit breaker open after {consecutive} consecutive rate-limit responses")]
    CircuitOpen { consecutive: u32 },

    #[error("{0}")]
    Transport(String),

    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("cannot build request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Whether the provider received load for this attempt. Rate-limit rejections and
    /// requests that were never sent cost nothing.
    pub fn charges_budget(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Status { .. })
    }
}

pub struct FetchClient<P: Provider, T: Transport, S: Sleeper> {
    provider: P,
    transport: T,
    sleeper: S,
    policy: FetchPolicy,
    today: NaiveDate,
    consecutive_rate_limits: u32,
    pages_served: usize,
}

impl<P: Provider, T: Transport, S: Sleeper> FetchClient<P, T, S> {
    pub fn new(provider: P, transport: T, sleeper: S, policy: FetchPolicy, today: NaiveDate) -> Self {
        Self {
            provider,
            transport,
            sleeper,
            policy,
            today,
            consecutive_rate_limits: 0,
            pages_served: 0,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn consecutive_rate_limits(&self) -> u32 {
        self.consecutive_rate_limits
    }

    /// Successful page responses in the most recent `fetch`, including one that later failed.
    pub fn pages_served(&self) -> usize {
        self.pages_served
    }

    pub fn fetch(&mut self, target: &Target, period: Period) -> Result<RawPayload, FetchError> {
        self.pages_served = 0;
        let mut request = self.provider.request(target, period, self.today)?;
        let mut pages = Vec::new();
        loop {
            let body = self.send(&request)?;
            self.pages_served += 1;
            let next = self.provider.next_page(&request, &body);
            pages.push(body);
            match next {
                Some(next) if pages.len() < MAX_PAGES_PER_UNIT => {
                    let delay = self.provider.page_delay();
                    if !delay.is_zero() {
                        self.sleeper.sleep(delay);
                    }
                    request = next;
                }
                Some(_) => {
                    warn!(
                        target_id = %target.id,
                        period = %period,
                        pages = pages.len(),
                        "page limit reached, keeping pages fetched so far"
                    );
                    break;
                }
                None => break,
            }
        }
        Ok(RawPayload { pages })
    }

    fn send(&mut self, request: &HttpRequest) -> Result<String, FetchError> {
        let mut rate_limit_attempts = 0u32;
        let mut transport_attempts = 0u32;
        loop {
            debug!(url = %request.url, "provider request");
            match self.transport.get(request) {
                Ok(response) if self.provider.is_rate_limited(&response) => {
                    self.consecutive_rate_limits += 1;
                    rate_limit_attempts += 1;
                    if self.consecutive_rate_limits >= self.policy.circuit_breaker_threshold {
                        return Err(FetchError::CircuitOpen {
                            consecutive: self.consecutive_rate_limits,
                        });
                    }
                    if rate_limit_attempts > self.policy.max_rate_limit_retries {
                        return Err(FetchError::RateLimited {
                            attempts: rate_limit_attempts,
                        });
                    }
                    let delay = self.policy.rate_limit_backoff(rate_limit_attempts);
                    warn!(
                        attempt = rate_limit_attempts,
                        consecutive = self.consecutive_rate_limits,
                        wait_secs = delay.as_secs_f64(),
                        "rate limited, backing off"
                    );
                    self.sleeper.sleep(delay);
                }
                Ok(response) if response.is_success() => {
                    self.consecutive_rate_limits = 0;
                    return Ok(response.body);
                }
                Ok(response) => {
                    self.consecutive_rate_limits = 0;
                    if response.status >= 500 && transport_attempts < self.policy.transport_retries
                    {
                        transport_attempts += 1;
                        warn!(status = response.status, attempt = transport_attempts, "server error, retrying");
                        self.sleeper.sleep(self.policy.transport_retry_delay);
                        continue;
                    }
                    return Err(FetchError::Status {
                        status: response.status,
                        body: truncate(&response.body),
                    });
                }
                Err(err) => {
                    if transport_attempts < self.policy.transport_retries {
                        transport_attempts += 1;
                        warn!(error = %err, attempt = transport_attempts, "transport error, retrying");
                        self.sleeper.sleep(self.policy.transport_retry_delay);
                        continue;
                    }
                    return Err(FetchError::Transport(err.to_string()));
                }
            }
        }
    }
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
