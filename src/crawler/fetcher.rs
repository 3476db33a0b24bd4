//! HTTP fetching with response classification and a bounded retry engine.
//! Retries are time-based sleeps inside a single `fetch` call; a URL never
//! re-enters the frontier because of a transient fetch failure.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;

const MAX_REDIRECTS: usize = 5;
const ACCEPTED_TYPES: &[&str] = &["text/html", "application/xhtml+xml", "application/json"];

/// How a fetch ended. Only `Ok` carries a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchClassification {
    Ok,
    IgnoredType,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
}

impl FetchClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchClassification::Ok => "ok",
            FetchClassification::IgnoredType => "ignored_type",
            FetchClassification::ClientError => "client_error",
            FetchClassification::ServerError => "server_error",
            FetchClassification::NetworkError => "network_error",
            FetchClassification::Timeout => "fetch_timeout",
        }
    }
}

/// Result of one fetch, after redirects and retries.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub final_url: String,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub elapsed_ms: u64,
    /// Present only for 2xx responses with an accepted content type.
    pub body: Option<String>,
    pub classification: FetchClassification,
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        self.classification == FetchClassification::Ok
    }
}

/// The fetch seam. Production uses [`HttpFetcher`]; tests script responses.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchOutcome;
}

/// Which retry schedule a failure falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryKind {
    /// HTTP 429 or a connection-level failure: 5 s, 10 s, 20 s.
    RateLimitOrNetwork,
    /// Other 5xx: 5 s, 10 s.
    ServerError,
}

/// Backoff delay before retry number `attempt` (0-based), or `None` when the
/// budget is spent. `base` is 5 s in production, shrunk in tests.
fn retry_delay(kind: RetryKind, attempt: u32, base: Duration) -> Option<Duration> {
    let max_retries = match kind {
        RetryKind::RateLimitOrNetwork => 3,
        RetryKind::ServerError => 2,
    };
    if attempt >= max_retries {
        None
    } else {
        Some(base * 2u32.pow(attempt))
    }
}

fn accepted_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let media = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            ACCEPTED_TYPES.contains(&media.as_str())
        }
        None => false,
    }
}

/// Reqwest-backed fetcher: fixed timeout, bounded redirects, TLS verification
/// on, gzip transparent.
pub struct HttpFetcher {
    client: Client,
    backoff_base: Duration,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        Self::with_backoff(user_agent, timeout, Duration::from_secs(5))
    }

    pub fn with_backoff(user_agent: &str, timeout: Duration, backoff_base: Duration) -> Self {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .gzip(true)
            .build()
            .expect("failed to build HTTP client");
        HttpFetcher {
            client,
            backoff_base,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchOutcome, FetchFailure> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchFailure::Timeout
            } else {
                FetchFailure::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        if status == 429 {
            return Err(FetchFailure::RateLimited {
                final_url,
                content_type,
            });
        }
        if (500..600).contains(&status) {
            return Err(FetchFailure::Server {
                status,
                final_url,
                content_type,
            });
        }

        let classification = if (200..300).contains(&status) {
            if accepted_content_type(content_type.as_deref()) {
                FetchClassification::Ok
            } else {
                FetchClassification::IgnoredType
            }
        } else {
            FetchClassification::ClientError
        };

        let body = if classification == FetchClassification::Ok {
            match response.text().await {
                Ok(text) => Some(text),
                Err(e) if e.is_timeout() => return Err(FetchFailure::Timeout),
                Err(e) => return Err(FetchFailure::Network(e.to_string())),
            }
        } else {
            None
        };

        Ok(FetchOutcome {
            final_url,
            status: Some(status),
            content_type,
            elapsed_ms: 0,
            body,
            classification,
        })
    }
}

/// Internal failure carrier for the retry loop.
enum FetchFailure {
    Timeout,
    Network(String),
    RateLimited {
        final_url: String,
        content_type: Option<String>,
    },
    Server {
        status: u16,
        final_url: String,
        content_type: Option<String>,
    },
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        let started = Instant::now();
        let mut network_attempt: u32 = 0;
        let mut server_attempt: u32 = 0;

        let outcome = loop {
            match self.fetch_once(url).await {
                Ok(outcome) => break outcome,
                // Timeouts are terminal; the page gets recorded as such.
                Err(FetchFailure::Timeout) => {
                    break FetchOutcome {
                        final_url: url.to_string(),
                        status: None,
                        content_type: None,
                        elapsed_ms: 0,
                        body: None,
                        classification: FetchClassification::Timeout,
                    };
                }
                Err(FetchFailure::Network(err)) => {
                    match retry_delay(
                        RetryKind::RateLimitOrNetwork,
                        network_attempt,
                        self.backoff_base,
                    ) {
                        Some(delay) => {
                            tracing::debug!(url, error = %err, retry_in_s = delay.as_secs_f64(), "network error, backing off");
                            tokio::time::sleep(delay).await;
                            network_attempt += 1;
                        }
                        None => {
                            break FetchOutcome {
                                final_url: url.to_string(),
                                status: None,
                                content_type: None,
                                elapsed_ms: 0,
                                body: None,
                                classification: FetchClassification::NetworkError,
                            };
                        }
                    }
                }
                Err(FetchFailure::RateLimited {
                    final_url,
                    content_type,
                }) => {
                    match retry_delay(
                        RetryKind::RateLimitOrNetwork,
                        network_attempt,
                        self.backoff_base,
                    ) {
                        Some(delay) => {
                            tracing::debug!(url, retry_in_s = delay.as_secs_f64(), "429, backing off");
                            tokio::time::sleep(delay).await;
                            network_attempt += 1;
                        }
                        None => {
                            break FetchOutcome {
                                final_url,
                                status: Some(429),
                                content_type,
                                elapsed_ms: 0,
                                body: None,
                                classification: FetchClassification::ClientError,
                            };
                        }
                    }
                }
                Err(FetchFailure::Server {
                    status,
                    final_url,
                    content_type,
                }) => {
                    match retry_delay(RetryKind::ServerError, server_attempt, self.backoff_base) {
                        Some(delay) => {
                            tracing::debug!(url, status, retry_in_s = delay.as_secs_f64(), "server error, backing off");
                            tokio::time::sleep(delay).await;
                            server_attempt += 1;
                        }
                        None => {
                            break FetchOutcome {
                                final_url,
                                status: Some(status),
                                content_type,
                                elapsed_ms: 0,
                                body: None,
                                classification: FetchClassification::ServerError,
                            };
                        }
                    }
                }
            }
        };

        FetchOutcome {
            elapsed_ms: started.elapsed().as_millis() as u64,
            ..outcome
        }
    }
}
