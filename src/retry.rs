use std::time::Duration;

use tokio::time::sleep;

use crate::{
    errors::ErrorKind,
    extractor::Extractor,
    types::{BatchOutcome, Extraction},
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// attempts in total, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base, 2*base, 4*base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
enum UrlState {
    Pending,
    Attempting(u32),
    RetryWait { attempt: u32, delay: Duration },
    Success { attempt: u32, extraction: Extraction },
    Failed { attempt: u32, error: ErrorKind },
}

/// Runs one url to a terminal state. Whatever happens, exactly one outcome is
/// produced for the url.
pub async fn extract_with_retry(
    extractor: &dyn Extractor,
    policy: &RetryPolicy,
    index: usize,
    url: &str,
    session_id: &str,
) -> BatchOutcome {
    let mut state = UrlState::Pending;
    loop {
        state = match state {
            UrlState::Pending => UrlState::Attempting(1),
            UrlState::Attempting(attempt) => match extractor.extract(url).await {
                Ok(extraction) if extraction.record.article_id.trim().is_empty() => {
                    UrlState::Failed {
                        attempt,
                        error: ErrorKind::MissingArticleId,
                    }
                }
                Ok(extraction) => UrlState::Success {
                    attempt,
                    extraction,
                },
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "[session {}] attempt {} failed for {}: {}, retrying in {:?}",
                        session_id, attempt, url, e, delay
                    );
                    UrlState::RetryWait { attempt, delay }
                }
                Err(e) => UrlState::Failed {
                    attempt,
                    error: e.into(),
                },
            },
            UrlState::RetryWait { attempt, delay } => {
                sleep(delay).await;
                UrlState::Attempting(attempt + 1)
            }
            UrlState::Success {
                attempt,
                extraction,
            } => {
                debug!(
                    "[session {}] extracted {} on attempt {}",
                    session_id, url, attempt
                );
                return BatchOutcome::succeeded(index, url, attempt, extraction);
            }
            UrlState::Failed { attempt, error } => {
                warn!(
                    "[session {}] giving up on {} after {} attempt(s): {}",
                    session_id, url, attempt, error
                );
                return BatchOutcome::failed(index, url, attempt, error);
            }
        }
    }
}
