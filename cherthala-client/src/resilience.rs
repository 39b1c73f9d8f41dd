//! Deadline, retry and fallback around single backend calls.
//!
//! [`with_deadline`] races a future against a timer. When the timer wins the
//! future is dropped, which cancels it at its next suspension point; work the
//! backend already accepted (a request on the wire) still completes there.
//!
//! [`optimized_query`] layers a fixed-backoff retry and a fallback value on
//! top and never returns an error: failures resolve to
//! `QueryOutcome { data: fallback, error: Some(message) }`.

use std::future::Future;
use std::time::Duration;

use cherthala_core::{CherthalaError, CherthalaResult, QueryConfig};

/// Run `future` with a deadline.
///
/// A timer win yields [`CherthalaError::Timeout`] naming `operation`. Errors
/// from the future are converted, so backend errors get classified.
pub async fn with_deadline<T, E, F>(
    operation: &str,
    duration: Duration,
    future: F,
) -> CherthalaResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<CherthalaError>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(CherthalaError::timeout(operation, duration)),
    }
}

/// Options for [`optimized_query`].
#[derive(Debug, Clone)]
pub struct QueryOptions<T> {
    /// Name used in logs and timeout errors.
    pub operation: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
    /// Returned as `data` once every attempt has failed.
    pub fallback: Option<T>,
}

impl<T> QueryOptions<T> {
    /// Options with the shipped defaults (5 s, one retry, 1 s backoff).
    pub fn new(operation: impl Into<String>) -> Self {
        Self::from_config(operation, &QueryConfig::default())
    }

    pub fn from_config(operation: impl Into<String>, config: &QueryConfig) -> Self {
        Self {
            operation: operation.into(),
            timeout: config.timeout,
            retries: config.retries,
            retry_backoff: config.retry_backoff,
            fallback: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_fallback(mut self, fallback: T) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// `{data, error}` result of a resilient query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome<T> {
    pub data: Option<T>,
    /// User-facing message; `None` on success.
    pub error: Option<String>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

impl<T> QueryOutcome<T> {
    pub fn success(data: Option<T>, attempts: u32) -> Self {
        Self {
            data,
            error: None,
            attempts,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Data or the fallback, dropping the message.
    pub fn into_data(self) -> Option<T> {
        self.data
    }
}

/// Classify a failure and pair it with the fallback.
///
/// The message is one of the fixed user-facing strings (timeout, not found,
/// generic) or the backend's own message.
pub fn handle_backend_error<T>(err: CherthalaError, fallback: Option<T>) -> QueryOutcome<T> {
    tracing::error!(error = %err, "Backend query failed");
    QueryOutcome {
        data: fallback,
        error: Some(err.user_message()),
        attempts: 1,
    }
}

/// Run `operation` under a deadline, retrying failures after a fixed delay.
///
/// `NotFound` is not retried: it resolves immediately to a success with no
/// data. Any other failure is retried up to `options.retries` times; after
/// the last one the fallback is returned alongside the error message.
pub async fn optimized_query<T, F, Fut, E>(mut operation: F, options: QueryOptions<T>) -> QueryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<CherthalaError>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match with_deadline(&options.operation, options.timeout, operation()).await {
            Ok(data) => return QueryOutcome::success(Some(data), attempts),
            Err(CherthalaError::NotFound) => return QueryOutcome::success(None, attempts),
            Err(err) if attempts <= options.retries => {
                tracing::debug!(
                    operation = %options.operation,
                    attempt = attempts,
                    error = %err,
                    "Query failed, retrying"
                );
                tokio::time::sleep(options.retry_backoff).await;
            }
            Err(err) => {
                let mut outcome = handle_backend_error(err, options.fallback);
                outcome.attempts = attempts;
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cherthala_core::BackendError;

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_passes_through_result() {
        let ok = with_deadline("q", Duration::from_secs(1), async { Ok::<_, BackendError>(7) }).await;
        assert_eq!(ok, Ok(7));

        let err = with_deadline("q", Duration::from_secs(1), async {
            Err::<u32, _>(BackendError::not_found())
        })
        .await;
        assert_eq!(err, Err(CherthalaError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let result = with_deadline("slow", Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, BackendError>(1)
        })
        .await;
        assert!(matches!(result, Err(CherthalaError::Timeout { ref operation, .. }) if operation == "slow"));
    }

    #[test]
    fn test_handle_backend_error_messages() {
        let timeout = handle_backend_error(
            CherthalaError::timeout("q", Duration::from_secs(5)),
            Some(vec![1]),
        );
        assert_eq!(timeout.data, Some(vec![1]));
        assert_eq!(timeout.error.as_deref(), Some("Request timed out. Please try again."));

        let generic = handle_backend_error::<()>(BackendError::new("").into(), None);
        assert_eq!(generic.error.as_deref(), Some("Something went wrong."));
    }

    #[test]
    fn test_options_follow_config() {
        let config = QueryConfig {
            timeout: Duration::from_secs(2),
            retries: 3,
            retry_backoff: Duration::from_millis(250),
        };
        let options = QueryOptions::<()>::from_config("list", &config);
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert_eq!(options.retries, 3);
        assert_eq!(options.retry_backoff, Duration::from_millis(250));
        assert!(options.fallback.is_none());
    }
}
