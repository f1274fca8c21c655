//! Retry policy for device commands
//!
//! A command is attempted once, and retried after a fixed sleep when the
//! device answers with a gateway/overload status. Transport failures such as
//! timeouts or refused connections are returned to the caller untouched.

use std::time::Duration;

use tracing::warn;

use twainlocal_core::constants::{DEFAULT_RETRIES, RETRY_DELAY, RETRYABLE_STATUSES};

use crate::{HttpRequest, HttpResponse, Transport, error::Result};

/// How often and how patiently to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: u32,
    /// Sleep between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            delay: RETRY_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn is_retryable_status(status: u16) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRIES)
    }
}

/// Run `request` through `transport`, retrying per `policy`
///
/// Once retries are exhausted the last response (or error) is returned as is.
pub async fn execute_with_retry(
    transport: &dyn Transport,
    request: &HttpRequest,
    timeout: Duration,
    policy: RetryPolicy,
) -> Result<HttpResponse> {
    let mut attempt = 0;

    loop {
        match transport.execute(request, timeout).await {
            Ok(response)
                if RetryPolicy::is_retryable_status(response.status) && attempt < policy.retries =>
            {
                warn!(
                    "{} answered HTTP {}, retrying ({}/{})",
                    request.path,
                    response.status,
                    attempt + 1,
                    policy.retries
                );
            }
            other => return other,
        }

        attempt += 1;
        tokio::time::sleep(policy.delay).await;
    }
}
