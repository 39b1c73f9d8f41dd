//! Settle-all batches under one deadline.

use std::time::Duration;

use cherthala_core::{BackendError, CherthalaError, CherthalaResult};
use futures_util::future::{join_all, BoxFuture};

/// A batch member: any boxed backend call.
pub type BatchQuery<'a, T> = BoxFuture<'a, Result<T, BackendError>>;

/// Run every query concurrently and wait for all of them to settle.
///
/// The output has one entry per input, in input order. A failing member does
/// not affect the others. If `timeout` elapses first, every entry is the same
/// timeout error, including members that had already succeeded.
pub async fn batch_queries<T>(
    queries: Vec<BatchQuery<'_, T>>,
    timeout: Duration,
) -> Vec<CherthalaResult<T>> {
    let count = queries.len();
    match tokio::time::timeout(timeout, join_all(queries)).await {
        Ok(results) => results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.map_err(|err| {
                    let err = CherthalaError::from(err);
                    tracing::warn!(index, error = %err, "Batch query failed");
                    err
                })
            })
            .collect(),
        Err(_) => {
            tracing::warn!(count, ?timeout, "Batch queries timed out");
            let err = CherthalaError::timeout("batch queries", timeout);
            (0..count).map(|_| Err(err.clone())).collect()
        }
    }
}

/// Summary of a settled batch, for logging and degraded views.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    /// `(index, user-facing message)` per failed member.
    pub failures: Vec<(usize, String)>,
}

impl BatchReport {
    pub fn from_results<T>(results: &[CherthalaResult<T>]) -> Self {
        let failures: Vec<(usize, String)> = results
            .iter()
            .enumerate()
            .filter_map(|(index, r)| r.as_ref().err().map(|e| (index, e.user_message())))
            .collect();
        Self {
            total: results.len(),
            succeeded: results.len() - failures.len(),
            failures,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.failures.iter().map(|(_, m)| m.clone()).collect()
    }
}
