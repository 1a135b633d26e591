use std::future::Future;
use std::time::Duration;

use super::client::WebDAVError;

/// Retry-with-backoff policy shared by every transport operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Non-5xx statuses that are worth retrying
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            retryable_statuses: vec![408, 429],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        (500..600).contains(&status) || self.retryable_statuses.contains(&status)
    }

    /// Whether an error is transient
    pub fn is_retryable(&self, err: &WebDAVError) -> bool {
        match err {
            WebDAVError::Server { status, .. } => self.is_retryable_status(*status),
            WebDAVError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent
    pub async fn run<F, Fut, T>(&self, op_name: &str, mut op: F) -> Result<T, WebDAVError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WebDAVError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 < attempts && self.is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "WebDAV: {} failed (attempt {}/{}): {}; retrying in {}ms",
                        op_name,
                        attempt + 1,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
