//! Timeout-bounded, retried HTTP requests.
//!
//! [`ResilientFetcher`] wraps a [`Transport`] with the retry policy every
//! content request goes through: a per-attempt timeout, retry of 429/5xx and
//! transport failures with capped exponential backoff plus jitter, immediate
//! failure when offline or cancelled, and terminal 4xx responses handed back
//! to the caller untouched.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{is_retryable_status, FetchError};

const MAX_JITTER: f64 = 0.25;
const MAX_BACKOFF_EXPONENT: u32 = 16;
pub const DEFAULT_OFFLINE_RECHECK: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub url: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            url: url.into(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::Terminal {
                status: self.status,
                url: self.url,
            })
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body)
            .map_err(|err| FetchError::Decode(format!("{}: {err}", self.url)))
    }
}

/// A single network attempt. Implementations must honour `timeout` and
/// report transport-level failures as [`FetchError::Timeout`] or
/// [`FetchError::Transient`].
pub trait Transport: Send + Sync {
    fn execute(&self, request: &Request, timeout: Duration) -> Result<Response, FetchError>;
}

pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity as last observed by [`HttpTransport`]. Once the network is
/// unreachable, requests are refused until `recheck` has passed; the next one
/// is let through to find out whether it is back.
#[derive(Debug)]
pub struct NetworkStatus {
    offline_since: Mutex<Option<Instant>>,
    recheck: Duration,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::with_recheck(DEFAULT_OFFLINE_RECHECK)
    }
}

impl NetworkStatus {
    pub fn with_recheck(recheck: Duration) -> Self {
        Self {
            offline_since: Mutex::new(None),
            recheck,
        }
    }

    pub fn set_online(&self, online: bool) {
        let mut offline_since = self.offline_since.lock();
        if online {
            if offline_since.take().is_some() {
                info!("network reachable again");
            }
        } else {
            if offline_since.is_none() {
                warn!(recheck = ?self.recheck, "network unreachable, going offline");
            }
            *offline_since = Some(Instant::now());
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline_since.lock().is_some()
    }
}

impl Connectivity for NetworkStatus {
    fn is_online(&self) -> bool {
        match *self.offline_since.lock() {
            Some(since) => since.elapsed() >= self.recheck,
            None => true,
        }
    }
}

/// Cancellation signal threaded from a caller into the fetcher.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.inner.cancelled.lock() = true;
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for `duration` unless cancelled first. Returns `true` when cancelled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .signal
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }
        *cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt * (1 + jitter), max_delay)` where `jitter` is a
    /// fraction clamped to `0..=0.25`.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        let exponential = self.base_delay.saturating_mul(factor);
        let jittered = exponential.mul_f64(1.0 + jitter.clamp(0.0, MAX_JITTER));
        jittered.min(self.max_delay)
    }
}

pub struct HttpTransport {
    http: HttpClient,
    user_agent: String,
    network: Option<Arc<NetworkStatus>>,
}

impl HttpTransport {
    pub fn new(user_agent: impl Into<String>, http_client: Option<HttpClient>) -> anyhow::Result<Self> {
        let user_agent = user_agent.into();
        anyhow::ensure!(!user_agent.trim().is_empty(), "net: user agent required");
        let http = match http_client {
            Some(client) => client,
            None => HttpClient::builder().build()?,
        };
        Ok(Self {
            http,
            user_agent,
            network: None,
        })
    }

    /// Reports reachability to `network`: a connect failure marks it offline,
    /// any response marks it online.
    pub fn with_network_status(mut self, network: Arc<NetworkStatus>) -> Self {
        self.network = Some(network);
        self
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: &Request, timeout: Duration) -> Result<Response, FetchError> {
        let mut builder = self
            .http
            .get(&request.url)
            .header(USER_AGENT, &self.user_agent)
            .header("Api-User-Agent", &self.user_agent)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let classify = |err: reqwest::Error| {
            if err.is_timeout() {
                FetchError::Timeout(timeout)
            } else {
                FetchError::Transient {
                    status: None,
                    message: err.to_string(),
                }
            }
        };

        let response = match builder.send() {
            Ok(response) => response,
            Err(err) => {
                if err.is_connect() {
                    if let Some(network) = &self.network {
                        network.set_online(false);
                    }
                }
                return Err(classify(err));
            }
        };
        if let Some(network) = &self.network {
            network.set_online(true);
        }
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.bytes().map_err(classify)?.to_vec();
        Ok(Response { status, url, body })
    }
}

/// Retries a [`Transport`] according to a [`RetryPolicy`]. Holds no mutable
/// state, so one instance can serve any number of concurrent callers.
pub struct ResilientFetcher {
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
    policy: RetryPolicy,
}

impl ResilientFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        connectivity: Arc<dyn Connectivity>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            connectivity,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn get(&self, url: &str, cancel: Option<&CancelToken>) -> Result<Response, FetchError> {
        self.request(&Request::get(url), cancel)
    }

    /// Returns successful and terminal (non-429 4xx, 3xx) responses as-is.
    /// Retryable failures are retried up to `max_retries` times; after that
    /// the call fails with [`FetchError::ExhaustedRetries`] wrapping the last
    /// failure (including its status when a response was received).
    pub fn request(
        &self,
        request: &Request,
        cancel: Option<&CancelToken>,
    ) -> Result<Response, FetchError> {
        let cancelled = || cancel.map(CancelToken::is_cancelled).unwrap_or(false);
        let mut attempt: u32 = 0;

        loop {
            if cancelled() {
                return Err(FetchError::Cancelled);
            }
            if !self.connectivity.is_online() {
                return Err(FetchError::Offline);
            }

            let outcome = self.transport.execute(request, self.policy.timeout);
            if cancelled() {
                return Err(FetchError::Cancelled);
            }

            let failure = match outcome {
                Ok(response) if is_retryable_status(response.status) => FetchError::Transient {
                    status: Some(response.status),
                    message: format!("{} responded {}", response.url, response.status),
                },
                Ok(response) => {
                    debug!(url = %request.url, status = response.status, attempt, "fetch complete");
                    return Ok(response);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };
            if !self.connectivity.is_online() {
                debug!(url = %request.url, error = %failure, "network went away, not retrying");
                return Err(FetchError::Offline);
            }

            if attempt >= self.policy.max_retries {
                warn!(url = %request.url, attempts = attempt + 1, error = %failure, "retries exhausted");
                return Err(FetchError::ExhaustedRetries {
                    attempts: attempt + 1,
                    last: Box::new(failure),
                });
            }

            let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
            let delay = self.policy.delay_for_attempt(attempt, jitter);
            debug!(url = %request.url, attempt, ?delay, error = %failure, "retrying");
            match cancel {
                Some(token) => {
                    if token.wait_timeout(delay) {
                        return Err(FetchError::Cancelled);
                    }
                }
                None => thread::sleep(delay),
            }
            attempt += 1;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn persistent_transient_failure_makes_n_plus_one_attempts() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/flaky", 503, "");
        let fetcher = fetcher(transport.clone(), 3);

        let err = fetcher.get("https://api.test/flaky", None).unwrap_err();
        assert_eq!(transport.attempts(), 4);
        match err {
            FetchError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 4);
                assert_eq!(last.status(), Some(503));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn not_found_is_returned_after_one_attempt() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/missing", 404, "");
        let fetcher = ResilientFetcher::new(
            transport.clone(),
            Arc::new(NetworkStatus::default()),
            RetryPolicy {
                base_delay: Duration::from_secs(5),
                ..quick_policy(3)
            },
        );

        let started = Instant::now();
        let response = fetcher.get("https://api.test/missing", None).unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(transport.attempts(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn offline_fails_without_attempting() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/any", 200, "{}");
        let fetcher = ResilientFetcher::new(transport.clone(), Arc::new(Offline), quick_policy(3));

        let err = fetcher.get("https://api.test/any", None).unwrap_err();
        assert_eq!(err, FetchError::Offline);
        assert_eq!(transport.attempts(), 0);
    }

    #[test]
    fn cancelled_before_start_is_terminal() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/any", 200, "{}");
        let fetcher = fetcher(transport.clone(), 3);
        let token = CancelToken::new();
        token.cancel();

        let err = fetcher.get("https://api.test/any", Some(&token)).unwrap_err();
        assert_eq!(err, FetchError::Cancelled);
        assert_eq!(transport.attempts(), 0);
    }

    #[test]
    fn server_error_then_success_returns_payload() {
        let transport = Arc::new(ScriptedTransport::default());
        transport
            .respond("/page", 500, "")
            .respond("/page", 200, r#"{"ok":true}"#);
        let fetcher = fetcher(transport.clone(), 3);

        let started = Instant::now();
        let response = fetcher.get("https://api.test/page", None).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.attempts(), 2);
        assert!(started.elapsed() >= Duration::from_millis(2));
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn timeouts_are_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport
            .fail("/slow", FetchError::Timeout(Duration::from_millis(200)))
            .respond("/slow", 200, "{}");
        let fetcher = fetcher(transport.clone(), 2);

        assert!(fetcher.get("https://api.test/slow", None).is_ok());
        assert_eq!(transport.attempts(), 2);
    }

    #[test]
    fn rate_limit_is_retryable() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/busy", 429, "");
        let fetcher = fetcher(transport.clone(), 1);

        let err = fetcher.get("https://api.test/busy", None).unwrap_err();
        assert_eq!(transport.attempts(), 2);
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn cancel_interrupts_backoff() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/down", 503, "");
        let fetcher = ResilientFetcher::new(
            transport.clone(),
            Arc::new(NetworkStatus::default()),
            RetryPolicy {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(10),
                ..quick_policy(3)
            },
        );
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = fetcher.get("https://api.test/down", Some(&token)).unwrap_err();
        handle.join().unwrap();
        assert_eq!(err, FetchError::Cancelled);
        assert_eq!(transport.attempts(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn network_status_lets_a_request_through_after_recheck() {
        let network = NetworkStatus::with_recheck(Duration::from_millis(30));
        assert!(network.is_online());

        network.set_online(false);
        assert!(!network.is_online());
        assert!(network.is_offline());

        thread::sleep(Duration::from_millis(40));
        assert!(network.is_online());
        assert!(network.is_offline());

        network.set_online(true);
        assert!(!network.is_offline());
    }

    #[test]
    fn refused_connection_takes_the_fetcher_offline() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let network = Arc::new(NetworkStatus::default());
        let transport = HttpTransport::new("wikifeed-tests/0.1", None)
            .unwrap()
            .with_network_status(network.clone());
        let fetcher = ResilientFetcher::new(
            Arc::new(transport),
            network.clone(),
            RetryPolicy {
                base_delay: Duration::from_secs(5),
                ..quick_policy(3)
            },
        );
        let url = format!("http://127.0.0.1:{port}/page");

        let started = Instant::now();
        assert_eq!(fetcher.get(&url, None).unwrap_err(), FetchError::Offline);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(network.is_offline());
        assert!(!network.is_online());

        assert_eq!(fetcher.get(&url, None).unwrap_err(), FetchError::Offline);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0, 0.0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3, 0.0), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(1, 0.25), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1, 4.0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(30, 0.0), Duration::from_secs(30));
    }
}
