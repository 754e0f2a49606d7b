//! Bounded-concurrency batch runner.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use skyhop_engine::EngineError;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::BatchError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Operations running at once.
    pub concurrency: usize,
    /// Re-raise quota and foreign-node failures once for the batch instead
    /// of counting them per item.
    pub rethrow_fatal: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rethrow_fatal: true,
        }
    }
}

/// Account usage cache, refreshed after a batch changed stored data.
pub trait UsageCache: Send + Sync {
    /// Marks the cached usage stale. Must not block.
    fn invalidate(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    AllSucceeded,
    PartiallySucceeded,
    AllFailed,
    Empty,
}

/// Result of a batch whose errors were all per-item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Set only when fatal errors are counted instead of re-raised.
    pub first_foreign_node_error: Option<EngineError>,
    pub first_quota_error: Option<EngineError>,
}

impl BatchResult {
    pub fn error_count(&self) -> usize {
        self.failed
    }

    pub fn outcome(&self) -> BatchOutcome {
        match (self.attempted, self.failed) {
            (0, _) => BatchOutcome::Empty,
            (_, 0) => BatchOutcome::AllSucceeded,
            (attempted, failed) if failed >= attempted => BatchOutcome::AllFailed,
            _ => BatchOutcome::PartiallySucceeded,
        }
    }
}

/// Runs `op` once per `(source, destination)` pair, at most
/// `config.concurrency` at a time.
///
/// No failure cancels the other operations. When `rethrow_fatal` is set the
/// first quota or foreign-node error is returned as [`BatchError::Fatal`]
/// once every operation has finished. `usage` is invalidated whenever at
/// least one operation succeeded.
pub async fn run_batch<S, D, T, F, Fut>(
    items: impl IntoIterator<Item = (S, D)>,
    config: &BatchConfig,
    usage: Option<&dyn UsageCache>,
    op: F,
) -> Result<BatchResult, BatchError>
where
    S: Send + 'static,
    D: Send + 'static,
    T: Send + 'static,
    F: Fn(S, D) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    if config.concurrency == 0 {
        return Err(BatchError::Config("concurrency must be at least 1".into()));
    }

    let gate = Arc::new(Semaphore::new(config.concurrency));
    let op = Arc::new(op);
    let mut tasks: JoinSet<Result<T, EngineError>> = JoinSet::new();

    for (source, destination) in items {
        let gate = Arc::clone(&gate);
        let op = Arc::clone(&op);
        tasks.spawn(async move {
            let _permit = gate.acquire_owned().await.map_err(|_| EngineError::Closed)?;
            op(source, destination).await
        });
    }

    let mut result = BatchResult {
        attempted: tasks.len(),
        ..BatchResult::default()
    };
    let mut fatal = None;

    while let Some(joined) = tasks.join_next().await {
        let error = match joined {
            Ok(Ok(_)) => {
                result.succeeded += 1;
                continue;
            }
            Ok(Err(e)) => e,
            Err(e) => {
                warn!("batch task failed to complete: {e}");
                result.failed += 1;
                continue;
            }
        };

        debug!("batch item failed: {error}");
        if config.rethrow_fatal && error.is_batch_fatal() {
            fatal.get_or_insert(error);
            continue;
        }
        result.failed += 1;
        if error.is_foreign_node() {
            result.first_foreign_node_error.get_or_insert(error);
        } else if error.is_quota() {
            result.first_quota_error.get_or_insert(error);
        }
    }

    if result.succeeded > 0
        && let Some(usage) = usage
    {
        usage.invalidate();
    }

    if let Some(error) = fatal {
        warn!(succeeded = result.succeeded, "node batch aborted: {error}");
        return Err(BatchError::Fatal(error));
    }

    info!(
        attempted = result.attempted,
        succeeded = result.succeeded,
        failed = result.failed,
        "node batch finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingCache(AtomicUsize);

    impl UsageCache for CountingCache {
        fn invalidate(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn outcome_of(attempted: usize, failed: usize) -> BatchOutcome {
        BatchResult {
            attempted,
            succeeded: attempted - failed,
            failed,
            ..BatchResult::default()
        }
        .outcome()
    }

    #[test]
    fn outcomes() {
        assert_eq!(outcome_of(0, 0), BatchOutcome::Empty);
        assert_eq!(outcome_of(3, 0), BatchOutcome::AllSucceeded);
        assert_eq!(outcome_of(3, 1), BatchOutcome::PartiallySucceeded);
        assert_eq!(outcome_of(3, 3), BatchOutcome::AllFailed);
    }

    #[tokio::test]
    async fn counts_failures_without_cancelling_siblings() {
        let cache = CountingCache::default();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);

        let result = run_batch(
            (0..5).map(|i| (i, ())),
            &BatchConfig::default(),
            Some(&cache),
            move |i: i32, _| {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    if i % 2 == 0 {
                        Ok(i)
                    } else {
                        Err(EngineError::Remote {
                            code: -1,
                            message: "nope".into(),
                        })
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.attempted, 5);
        assert_eq!(result.error_count(), 2);
        assert_eq!(result.succeeded, 3);
        assert_eq!(finished.load(Ordering::SeqCst), 5);
        assert_eq!(cache.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_error_raised_once_after_all_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);

        let err = run_batch(
            (0..4).map(|i| (i, ())),
            &BatchConfig::default(),
            None,
            move |i: i32, _| {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_millis(5 * i as u64)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    match i {
                        1 | 2 => Err(EngineError::StorageQuotaExceeded),
                        _ => Ok(()),
                    }
                }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BatchError::Fatal(EngineError::StorageQuotaExceeded)));
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_counted_when_not_rethrown() {
        let config = BatchConfig {
            rethrow_fatal: false,
            ..BatchConfig::default()
        };
        let result = run_batch(
            vec![(1, ()), (2, ())],
            &config,
            None,
            |i: i32, _| async move {
                Err::<(), _>(if i == 1 {
                    EngineError::ForeignNode
                } else {
                    EngineError::TransferQuotaExceeded
                })
            },
        )
        .await
        .unwrap();

        assert_eq!(result.outcome(), BatchOutcome::AllFailed);
        assert_eq!(result.first_foreign_node_error, Some(EngineError::ForeignNode));
        assert_eq!(
            result.first_quota_error,
            Some(EngineError::TransferQuotaExceeded)
        );
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let config = BatchConfig {
            concurrency: 3,
            ..BatchConfig::default()
        };

        let result = run_batch((0..12).map(|i| (i, ())), &config, None, move |_: i32, _| {
            let (r, p) = (Arc::clone(&r), Arc::clone(&p));
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(result.succeeded, 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_success_leaves_cache_alone() {
        let cache = CountingCache::default();
        let result = run_batch(
            vec![((), ())],
            &BatchConfig::default(),
            Some(&cache),
            |_, _| async { Err::<(), _>(EngineError::Cancelled) },
        )
        .await
        .unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(cache.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let config = BatchConfig {
            concurrency: 0,
            ..BatchConfig::default()
        };
        let err = run_batch(Vec::<((), ())>::new(), &config, None, |_, _| async {
            Ok::<(), EngineError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BatchError::Config(_)));
    }
}
