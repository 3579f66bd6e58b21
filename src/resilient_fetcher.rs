use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::data_fetcher::MarketDataSource;
use crate::error::{ErrorKind, FetchError, UpstreamError};
use crate::models::{AttemptOutcome, FetchAttempt, FetchRequest, SeriesData};

/// Lower-case substrings that mark an upstream message as transient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TransientSignatures(Vec<String>);

impl From<Vec<String>> for TransientSignatures {
    fn from(signatures: Vec<String>) -> Self {
        Self::new(signatures)
    }
}

impl From<TransientSignatures> for Vec<String> {
    fn from(signatures: TransientSignatures) -> Self {
        signatures.0
    }
}

impl Default for TransientSignatures {
    fn default() -> Self {
        Self::new([
            "rate limit",
            "too many requests",
            "429",
            "timeout",
            "timed out",
            "connection",
            "proxy",
            "max retries",
            "reset by peer",
        ])
    }
}

impl TransientSignatures {
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            signatures
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    fn find(&self, lowered: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|sig| lowered.contains(sig.as_str()))
            .map(String::as_str)
    }
}

/// Maps upstream failures onto [`ErrorKind`]. An explicit kind from the
/// source wins; otherwise the message is matched against the signatures.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    signatures: TransientSignatures,
}

impl Classifier {
    pub fn new(signatures: TransientSignatures) -> Self {
        Self { signatures }
    }

    pub fn classify(&self, error: &UpstreamError) -> ErrorKind {
        if let Some(kind) = error.kind {
            return kind;
        }

        let lowered = error.message.to_lowercase();
        match self.signatures.find(&lowered) {
            Some(sig) if sig.contains("proxy") => ErrorKind::Proxy,
            Some(sig) if sig.contains("time") => ErrorKind::Timeout,
            Some(sig) if sig.contains("rate") || sig.contains("too many") || sig.contains("429") => {
                ErrorKind::RateLimited
            }
            Some(_) => ErrorKind::Connection,
            None => ErrorKind::Other,
        }
    }
}

/// Upper bound on `max_retries`; with linear backoff anything larger waits for days.
pub const MAX_RETRIES: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.max_retries > MAX_RETRIES {
            return Err(FetchError::InvalidParameter(format!(
                "max_retries {} exceeds {}",
                self.max_retries, MAX_RETRIES
            )));
        }
        if self.base_delay.is_zero() {
            return Err(FetchError::InvalidParameter(
                "retry delay must be positive".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(FetchError::InvalidParameter(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait before retry `retry` (1-based): linear in the retry number.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }
}

/// Timeout, classification and linear-backoff retry around a [`MarketDataSource`].
pub struct ResilientFetcher {
    source: Arc<dyn MarketDataSource>,
    policy: RetryPolicy,
    classifier: Classifier,
}

impl ResilientFetcher {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        policy: RetryPolicy,
        classifier: Classifier,
    ) -> Result<Self, FetchError> {
        policy.validate()?;
        Ok(Self {
            source,
            policy,
            classifier,
        })
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<SeriesData, FetchError> {
        self.fetch_traced(request).await.0
    }

    /// Like [`fetch`](Self::fetch) but also returns the per-attempt trace.
    pub async fn fetch_traced(
        &self,
        request: &FetchRequest,
    ) -> (Result<SeriesData, FetchError>, Vec<FetchAttempt>) {
        let total = self.policy.max_retries.saturating_add(1);
        let mut attempts = Vec::new();
        let mut last_error = String::new();

        for attempt in 1..=total {
            let started = Instant::now();
            let result = tokio::time::timeout(self.policy.timeout, self.source.fetch(request)).await;

            let (kind, message) = match result {
                Ok(Ok(data)) => {
                    attempts.push(FetchAttempt {
                        attempt,
                        elapsed: started.elapsed(),
                        outcome: AttemptOutcome::Success,
                        backoff: None,
                    });
                    if attempt > 1 {
                        log::info!("{}: recovered on attempt {}/{}", request, attempt, total);
                    }
                    log::debug!("{}: {} records", request, data.len());
                    return (Ok(data), attempts);
                }
                Ok(Err(e)) => (self.classifier.classify(&e), e.message),
                Err(_) => (
                    ErrorKind::Timeout,
                    format!("timed out after {}s", self.policy.timeout.as_secs_f64()),
                ),
            };

            let elapsed = started.elapsed();

            if !kind.is_transient() {
                attempts.push(FetchAttempt {
                    attempt,
                    elapsed,
                    outcome: AttemptOutcome::Failed {
                        kind,
                        message: message.clone(),
                    },
                    backoff: None,
                });
                log::warn!("{}: non-retryable failure ({}): {}", request, kind, message);
                let error = FetchError::Fatal {
                    request: request.to_string(),
                    kind,
                    message,
                };
                return (Err(error), attempts);
            }

            // Only sleep if there are more attempts to make
            let backoff = (attempt < total).then(|| self.policy.backoff(attempt));
            attempts.push(FetchAttempt {
                attempt,
                elapsed,
                outcome: AttemptOutcome::Failed {
                    kind,
                    message: message.clone(),
                },
                backoff,
            });

            match backoff {
                Some(delay) => {
                    log::warn!(
                        "{}: attempt {}/{} failed ({}): {}; retrying in {:.1}s",
                        request,
                        attempt,
                        total,
                        kind,
                        message,
                        delay.as_secs_f64()
                    );
                    last_error = message;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    log::warn!(
                        "{}: attempt {}/{} failed ({}): {}",
                        request,
                        attempt,
                        total,
                        kind,
                        message
                    );
                    last_error = message;
                }
            }
        }

        log::error!("{}: giving up after {} attempts", request, total);
        let error = FetchError::DataUnavailable {
            request: request.to_string(),
            attempts: total,
            last_error,
        };
        (Err(error), attempts)
    }
}
