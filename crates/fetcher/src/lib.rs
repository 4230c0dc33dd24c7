use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use snapshot::RawPage;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

mod pool;
mod retry;
mod webdriver;

pub use pool::{BrowserSession, PooledSession, Rendered, SessionFactory, SessionPool};
pub use retry::RetryPolicy;
pub use webdriver::{WebDriverFactory, DEFAULT_USER_AGENT, DEFAULT_WEBDRIVER_URL};

pub const DEFAULT_BLOCK_MARKERS: &[&str] = &[
    "access denied",
    "verify you are human",
    "are you a robot",
    "unusual traffic from your",
    "px-captcha",
    "cf-challenge",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("navigation to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("browser session unavailable: {0}")]
    SessionUnavailable(String),
    /// The site served a challenge or block page; retrying within the cycle is pointless.
    #[error("{url} served a block page (matched `{marker}`)")]
    Blocked { url: String, marker: String },
    #[error("no browser session after {attempts} attempts: {reason}")]
    SessionsExhausted { attempts: u32, reason: String },
    #[error("session pool is shut down")]
    PoolClosed,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout { .. }
                | FetchError::Navigation { .. }
                | FetchError::SessionUnavailable(_)
        )
    }
}

/// A fetch that gave up, with the number of attempts it made.
#[derive(Debug, Error)]
#[error("{error} (attempt {attempts})")]
pub struct FetchFailure {
    pub attempts: u32,
    #[source]
    pub error: FetchError,
}

/// Render-completion signal to wait for after navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitFor {
    /// `document.readyState` reaches `complete`.
    ReadyState,
    /// A CSS selector matches at least one element.
    Element { selector: String },
    /// Fixed pause for client-side rendering and late network calls.
    Settle { millis: u64 },
}

impl WaitFor {
    pub fn defaults() -> Vec<WaitFor> {
        vec![WaitFor::ReadyState, WaitFor::Settle { millis: 4_000 }]
    }
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,
    pub wait: Vec<WaitFor>,
    pub navigation_timeout: Duration,
    pub block_markers: Vec<String>,
}

impl PageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            wait: WaitFor::defaults(),
            navigation_timeout: Duration::from_secs(60),
            block_markers: DEFAULT_BLOCK_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub page: RawPage,
    pub attempts: u32,
}

/// Returns the first block marker found in `html`, ignoring case.
pub fn detect_block<'a>(html: &str, markers: &'a [String]) -> Option<&'a str> {
    let lowered = html.to_lowercase();
    markers
        .iter()
        .find(|marker| !marker.is_empty() && lowered.contains(&marker.to_lowercase()))
        .map(String::as_str)
}

/// Loads pages through pooled browser sessions.
#[derive(Clone)]
pub struct Fetcher {
    pool: Arc<SessionPool>,
}

impl Fetcher {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Fetches `request`, retrying transient failures according to `policy`.
    ///
    /// Block pages end the fetch immediately. When every attempt failed to
    /// obtain a browser session the error is [`FetchError::SessionsExhausted`].
    pub async fn fetch(
        &self,
        request: &PageRequest,
        policy: &RetryPolicy,
    ) -> Result<Fetched, FetchFailure> {
        let max_attempts = policy.max_attempts.max(1);
        let mut session_failures = 0;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.attempt(request).await {
                Ok(page) => return Ok(Fetched { page, attempts: attempt }),
                Err(error) if !error.is_transient() => {
                    return Err(FetchFailure { attempts: attempt, error })
                }
                Err(error) => {
                    if matches!(error, FetchError::SessionUnavailable(_)) {
                        session_failures += 1;
                    }
                    warn!(url = %request.url, attempt, max_attempts, error = %error, "fetch attempt failed");
                    last_error = Some(error);
                    if attempt < max_attempts {
                        sleep(policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        let error = match last_error {
            Some(FetchError::SessionUnavailable(reason)) if session_failures == max_attempts => {
                FetchError::SessionsExhausted {
                    attempts: max_attempts,
                    reason,
                }
            }
            Some(error) => error,
            None => FetchError::PoolClosed,
        };
        Err(FetchFailure {
            attempts: max_attempts,
            error,
        })
    }

    async fn attempt(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
        let mut session = self.pool.checkout().await?;
        let rendered = match timeout(request.navigation_timeout, session.render(request)).await {
            Ok(Ok(rendered)) => rendered,
            Ok(Err(err)) => {
                session.discard().await;
                return Err(err);
            }
            Err(_) => {
                session.discard().await;
                return Err(FetchError::Timeout {
                    url: request.url.clone(),
                    after: request.navigation_timeout,
                });
            }
        };

        if let Some(marker) = detect_block(&rendered.html, &request.block_markers) {
            session.discard().await;
            return Err(FetchError::Blocked {
                url: rendered.url,
                marker: marker.to_string(),
            });
        }

        session.release();
        debug!(url = %rendered.url, bytes = rendered.html.len(), "page rendered");
        Ok(RawPage {
            url: rendered.url,
            html: rendered.html,
            fetched_at: Utc::now(),
        })
    }
}
