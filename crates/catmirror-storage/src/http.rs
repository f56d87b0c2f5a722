//! Resilient catalog HTTP: single-attempt transports, outcome classification, and a
//! retry state machine with capped, jittered exponential backoff.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, warn};

use crate::shutdown::ShutdownSignal;

/// Hard ceiling on any single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl CatalogRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// URL plus query string, safe for logs: header values are never included.
    pub fn display_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.url, query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Connect,
    Request,
    Body,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} failure: {message}")]
pub struct TransportError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, NetworkErrorKind::Other)
    }
}

/// Issues exactly one request attempt.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &CatalogRequest) -> Result<TransportResponse, TransportError>;
}

/// Time source for backoff decisions and sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that never blocks: sleeps are recorded and advance virtual time.
#[derive(Debug)]
pub struct VirtualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Retries after the first request; a request is attempted at most `max_retries + 1` times.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added on top of the exponential delay.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(100),
            max_delay: MAX_BACKOFF,
            jitter_ratio: 0.30,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt_index: usize, rng: &mut R) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let jitter = delay.mul_f64(rng.gen_range(0.0..=ratio));
        delay.saturating_add(jitter).min(MAX_BACKOFF)
    }

    /// Delay after a 429: the server's hint when present, otherwise exponential.
    pub fn rate_limit_delay<R: Rng + ?Sized>(
        &self,
        attempt_index: usize,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        retry_after
            .unwrap_or_else(|| self.jittered_delay(attempt_index, rng))
            .min(MAX_BACKOFF)
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(TransportResponse),
    RateLimited { retry_after: Option<Duration> },
    ServerError { status: u16 },
    ClientError { status: u16 },
    NetworkError { retryable: bool, message: String },
}

pub fn classify(
    result: Result<TransportResponse, TransportError>,
    now: DateTime<Utc>,
) -> Outcome {
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            return Outcome::NetworkError {
                retryable: err.is_retryable(),
                message: err.to_string(),
            }
        }
    };

    match response.status {
        200..=299 => Outcome::Success(response),
        429 => Outcome::RateLimited {
            retry_after: response
                .retry_after
                .as_deref()
                .and_then(|raw| parse_retry_after(raw, now)),
        },
        400..=499 => Outcome::ClientError {
            status: response.status,
        },
        // 1xx/3xx leaking through the client are as unexpected as a 5xx.
        status => Outcome::ServerError { status },
    }
}

/// Parses `Retry-After` as delta-seconds or an HTTP-date relative to `now`.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_BACKOFF));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delta = (at - now).to_std().unwrap_or(Duration::ZERO);
    Some(delta.min(MAX_BACKOFF))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastFailure {
    RateLimited,
    Status(u16),
    Network(String),
}

impl LastFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited => Some(429),
            Self::Status(status) => Some(*status),
            Self::Network(_) => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl fmt::Display for LastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited (429)"),
            Self::Status(status) => write!(f, "http {status}"),
            Self::Network(message) => write!(f, "network error: {message}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("client error http {status} for {url}")]
    Client { status: u16, url: String },
    #[error("retry budget exhausted after {attempts} attempts for {url}: {last}")]
    RetryExhausted {
        attempts: usize,
        url: String,
        last: LastFailure,
    },
    #[error("non-retryable network failure for {url}: {message}")]
    Network { url: String, message: String },
    #[error("request to {url} cancelled")]
    Cancelled { url: String },
    #[error(transparent)]
    Config(#[from] catmirror_core::ConfigError),
}

impl RequestError {
    pub fn last_status(&self) -> Option<u16> {
        match self {
            Self::Client { status, .. } => Some(*status),
            Self::RetryExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    pub fn is_network(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::RetryExhausted { last, .. } => last.is_network(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Client { status: u16 },
    Network { message: String },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Return(TransportResponse),
    Retry(Duration),
    Fail(Terminal),
}

/// Retry bookkeeping for one logical request.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: usize,
    pub total_delay: Duration,
    pub last: Option<LastFailure>,
}

impl RetryState {
    pub fn advance<R: Rng + ?Sized>(
        &mut self,
        outcome: Outcome,
        policy: &BackoffPolicy,
        rng: &mut R,
    ) -> NextAction {
        let attempt_index = self.attempts;
        self.attempts += 1;

        match outcome {
            Outcome::Success(response) => NextAction::Return(response),
            Outcome::ClientError { status } => NextAction::Fail(Terminal::Client { status }),
            Outcome::NetworkError {
                retryable: false,
                message,
            } => NextAction::Fail(Terminal::Network { message }),
            Outcome::RateLimited { retry_after } => {
                self.last = Some(LastFailure::RateLimited);
                let delay = policy.rate_limit_delay(attempt_index, retry_after, rng);
                self.retry_or_exhaust(attempt_index, policy, delay)
            }
            Outcome::ServerError { status } => {
                self.last = Some(LastFailure::Status(status));
                let delay = policy.jittered_delay(attempt_index, rng);
                self.retry_or_exhaust(attempt_index, policy, delay)
            }
            Outcome::NetworkError {
                retryable: true,
                message,
            } => {
                self.last = Some(LastFailure::Network(message));
                let delay = policy.jittered_delay(attempt_index, rng);
                self.retry_or_exhaust(attempt_index, policy, delay)
            }
        }
    }

    fn retry_or_exhaust(
        &mut self,
        attempt_index: usize,
        policy: &BackoffPolicy,
        delay: Duration,
    ) -> NextAction {
        if attempt_index >= policy.max_retries {
            return NextAction::Fail(Terminal::Exhausted);
        }
        self.total_delay += delay;
        NextAction::Retry(delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Politeness limit on outgoing requests: `burst` back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// `None` for a zero rate, which means unlimited.
    pub fn per_second(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            burst: requests,
            interval: Duration::from_secs(1) / requests,
        })
    }
}

/// Token bucket driven by the client's [`Clock`], so virtual time paces it too.
#[derive(Debug)]
struct RequestPacer {
    limit: RateLimit,
    state: AsyncMutex<PacerState>,
}

#[derive(Debug)]
struct PacerState {
    tokens: u32,
    refilled_at: DateTime<Utc>,
}

impl RequestPacer {
    fn new(limit: RateLimit, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            state: AsyncMutex::new(PacerState {
                tokens: limit.burst,
                refilled_at: now,
            }),
        }
    }

    async fn acquire(&self, clock: &dyn Clock) {
        let interval = self.limit.interval.max(Duration::from_micros(1));
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = (clock.now() - state.refilled_at).to_std().unwrap_or(Duration::ZERO);
                let refills = (elapsed.as_nanos() / interval.as_nanos()) as u32;
                if refills > 0 {
                    state.tokens = state.tokens.saturating_add(refills).min(self.limit.burst);
                    state.refilled_at += chrono::Duration::from_std(interval * refills)
                        .unwrap_or(chrono::Duration::zero());
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                interval.saturating_sub(elapsed.saturating_sub(interval * refills))
            };
            clock.sleep(wait).await;
        }
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        NetworkErrorKind::Timeout
    } else if err.is_connect() {
        NetworkErrorKind::Connect
    } else if err.is_request() {
        NetworkErrorKind::Request
    } else if err.is_body() || err.is_decode() {
        NetworkErrorKind::Body
    } else {
        NetworkErrorKind::Other
    }
}

/// Production transport over a shared `reqwest::Client` with a per-attempt timeout.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &CatalogRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder
            .send()
            .await
            .map_err(|err| TransportError::new(classify_reqwest_error(&err), err.to_string()))?;

        let status: StatusCode = resp.status();
        let final_url = resp.url().to_string();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|err| TransportError::new(NetworkErrorKind::Body, err.to_string()))?
            .to_vec();

        Ok(TransportResponse {
            status: status.as_u16(),
            retry_after,
            final_url,
            body,
        })
    }
}

/// Runs one logical request through the retry state machine.
pub struct ResilienceClient {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    global_limit: Arc<Semaphore>,
    pacer: Option<RequestPacer>,
    jitter: Mutex<StdRng>,
}

impl ResilienceClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        config: &HttpClientConfig,
    ) -> Self {
        let pacer = config.rate_limit.map(|limit| RequestPacer::new(limit, clock.now()));
        Self {
            transport,
            clock,
            backoff: config.backoff,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            pacer,
            jitter: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reqwest transport + system clock.
    pub fn from_config(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), Arc::new(SystemClock), config))
    }

    /// Makes jitter reproducible.
    pub fn with_jitter_seed(self, seed: u64) -> Self {
        Self {
            jitter: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn execute(
        &self,
        request: &CatalogRequest,
        shutdown: &ShutdownSignal,
    ) -> Result<TransportResponse, RequestError> {
        let url = request.display_url();
        let mut state = RetryState::default();

        loop {
            if shutdown.should_stop(self.clock.now()) {
                return Err(RequestError::Cancelled { url });
            }

            let result = {
                // Closed only on teardown.
                let _permit = self
                    .global_limit
                    .acquire()
                    .await
                    .map_err(|_| RequestError::Cancelled { url: url.clone() })?;
                if let Some(pacer) = &self.pacer {
                    pacer.acquire(self.clock.as_ref()).await;
                }
                self.transport.send(request).await
            };

            let outcome = classify(result, self.clock.now());
            let action = {
                let mut rng = self.jitter.lock().unwrap_or_else(PoisonError::into_inner);
                state.advance(outcome, &self.backoff, &mut *rng)
            };

            match action {
                NextAction::Return(response) => {
                    debug!(url = %url, attempts = state.attempts, status = response.status, "request succeeded");
                    return Ok(response);
                }
                NextAction::Retry(delay) => {
                    warn!(
                        url = %url,
                        attempt = state.attempts,
                        delay_ms = delay.as_millis() as u64,
                        last = %state.last.as_ref().map(ToString::to_string).unwrap_or_default(),
                        "transient failure, backing off"
                    );
                    self.backoff_sleep(delay, shutdown, &url).await?;
                }
                NextAction::Fail(Terminal::Client { status }) => {
                    return Err(RequestError::Client { status, url });
                }
                NextAction::Fail(Terminal::Network { message }) => {
                    return Err(RequestError::Network { url, message });
                }
                NextAction::Fail(Terminal::Exhausted) => {
                    return Err(RequestError::RetryExhausted {
                        attempts: state.attempts,
                        url,
                        last: state
                            .last
                            .unwrap_or_else(|| LastFailure::Network("unknown".to_string())),
                    });
                }
            }
        }
    }

    async fn backoff_sleep(
        &self,
        delay: Duration,
        shutdown: &ShutdownSignal,
        url: &str,
    ) -> Result<(), RequestError> {
        if let Some(deadline) = shutdown.deadline() {
            let remaining = (deadline - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            if delay > remaining {
                return Err(RequestError::Cancelled {
                    url: url.to_string(),
                });
            }
        }

        tokio::select! {
            _ = self.clock.sleep(delay) => Ok(()),
            _ = shutdown.cancelled() => Err(RequestError::Cancelled { url: url.to_string() }),
        }
    }
}
