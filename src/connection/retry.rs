//! Timeouts and bounded retries around a connection

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

use super::{CommandResult, Connection, RemoteCommand, Upload};
use crate::error::ConnectionError;

/// Exponential backoff budget for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails fatally, or the attempt budget runs out
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(operation = what, attempt, error = %e, delay = ?delay, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps a connection with a per-operation timeout and retries
pub struct ResilientConnection {
    inner: Arc<dyn Connection>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ResilientConnection {
    pub fn new(inner: Arc<dyn Connection>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, ConnectionError>>,
) -> Result<T, ConnectionError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout { timeout }),
    }
}

#[async_trait]
impl Connection for ResilientConnection {
    #[instrument(skip_all, fields(transport = self.inner.transport()))]
    async fn run(&self, command: &RemoteCommand) -> Result<CommandResult, ConnectionError> {
        with_retry(&self.policy, "run", || {
            bounded(self.timeout, self.inner.run(command))
        })
        .await
    }

    #[instrument(skip_all, fields(transport = self.inner.transport(), path = %upload.path))]
    async fn put(&self, upload: &Upload) -> Result<CommandResult, ConnectionError> {
        with_retry(&self.policy, "put", || {
            bounded(self.timeout, self.inner.put(upload))
        })
        .await
    }

    fn transport(&self) -> &'static str {
        self.inner.transport()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.inner.close().await
    }
}
