//! Bounded batch execution.
//!
//! Runs independent units of work through a sliding window of at most
//! `max_concurrency` in-flight items. Each item is retried with exponential
//! backoff; the whole batch aborts early once the failure threshold can no
//! longer be met, and never outlives its wall-clock budget.

use config_manager::BatchSettings;
use futures::stream::{FuturesUnordered, StreamExt};
use retry_utils::{retry_with_backoff, RetryConfig, RetryableError};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_concurrency: usize,
    /// Fraction of items (0.0..=1.0) allowed to fail before the batch aborts
    pub failure_threshold: f64,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub item_timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            failure_threshold: 0.5,
            timeout: Duration::from_secs(300),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(500),
            item_timeout: None,
        }
    }
}

impl From<&BatchSettings> for BatchConfig {
    fn from(settings: &BatchSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency,
            failure_threshold: settings.failure_threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
            retry_attempts: settings.retry_attempts,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            item_timeout: settings.item_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl BatchConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::exponential(self.retry_attempts, self.retry_delay.as_millis() as u64)
    }
}

/// How an item error should be retried. The default treats every error as transient.
pub trait RetryClassify: fmt::Display {
    fn retry_class(&self) -> RetryableError {
        RetryableError::Transient
    }
}

impl RetryClassify for String {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome<R> {
    Succeeded { value: R, attempts: u32 },
    Failed { error: String, attempts: u32 },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemOutcome<R> {
    pub id: String,
    pub index: usize,
    pub outcome: ItemOutcome<R>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    FailureThreshold {
        failed: usize,
        total: usize,
        threshold: f64,
    },
    Timeout {
        elapsed_ms: u64,
    },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::FailureThreshold {
                failed,
                total,
                threshold,
            } => write!(
                f,
                "{}/{} items failed, exceeding failure threshold {:.2}",
                failed, total, threshold
            ),
            AbortReason::Timeout { elapsed_ms } => {
                write!(f, "batch timed out after {}ms", elapsed_ms)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary<R> {
    pub total_items: usize,
    pub succeeded_items: usize,
    pub failed_items: usize,
    pub skipped_items: usize,
    pub success_rate: f64,
    /// One entry per submitted item, in submission order
    pub outcomes: Vec<BatchItemOutcome<R>>,
    pub aborted: Option<AbortReason>,
    pub duration_ms: u64,
}

impl<R> BatchSummary<R> {
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, &R)> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            ItemOutcome::Succeeded { value, .. } => Some((o.id.as_str(), value)),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            ItemOutcome::Failed { error, .. } => Some((o.id.as_str(), error.as_str())),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            ItemOutcome::Skipped { .. } => Some(o.id.as_str()),
            _ => None,
        })
    }
}

enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(e) => e.fmt(f),
            AttemptError::TimedOut(after) => write!(f, "item timed out after {}ms", after.as_millis()),
        }
    }
}

impl<E: RetryClassify> AttemptError<E> {
    fn retry_class(&self) -> RetryableError {
        match self {
            AttemptError::Failed(e) => e.retry_class(),
            AttemptError::TimedOut(_) => RetryableError::Transient,
        }
    }
}

/// Run `worker` over every item with bounded concurrency.
///
/// The summary always has one outcome per item. Items never started because
/// the batch aborted are `Skipped`; items still running when the batch budget
/// expires are cancelled and reported as `Failed`.
pub async fn process_batch<T, R, E, W, Fut, I>(
    items: &[T],
    worker: W,
    id_of: I,
    config: &BatchConfig,
) -> BatchSummary<R>
where
    W: Fn(&T, usize) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
    E: RetryClassify,
    I: Fn(&T, usize) -> String,
{
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + config.timeout;
    let total = items.len();
    let max_concurrency = config.max_concurrency.max(1);
    let retry = config.retry_config();

    let mut results: Vec<Option<ItemOutcome<R>>> = (0..total).map(|_| None).collect();
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut aborted: Option<AbortReason> = None;

    let run_item = |index: usize| {
        let worker = &worker;
        let retry = &retry;
        let item = &items[index];
        let item_timeout = config.item_timeout;
        async move {
            let retried = retry_with_backoff(
                || async move {
                    match item_timeout {
                        Some(limit) => match tokio::time::timeout(limit, worker(item, index)).await {
                            Ok(result) => result.map_err(AttemptError::Failed),
                            Err(_) => Err(AttemptError::TimedOut(limit)),
                        },
                        None => worker(item, index).await.map_err(AttemptError::Failed),
                    }
                },
                retry,
                |e: &AttemptError<E>| e.retry_class(),
            )
            .await;
            (index, retried)
        }
    };

    let mut in_flight = FuturesUnordered::new();
    let mut next = 0usize;

    loop {
        while aborted.is_none() && in_flight.len() < max_concurrency && next < total {
            in_flight.push(run_item(next));
            next += 1;
        }

        if in_flight.is_empty() {
            break;
        }

        match tokio::time::timeout_at(deadline, in_flight.next()).await {
            Ok(Some((index, retried))) => {
                let attempts = retried.attempts;
                let outcome = match retried.result {
                    Ok(value) => {
                        succeeded += 1;
                        ItemOutcome::Succeeded { value, attempts }
                    }
                    Err(e) => {
                        failed += 1;
                        debug!(
                            item = %id_of(&items[index], index),
                            attempts,
                            "Batch item failed: {}",
                            e
                        );
                        ItemOutcome::Failed {
                            error: e.to_string(),
                            attempts,
                        }
                    }
                };
                results[index] = Some(outcome);

                // Even if every remaining item succeeded the batch could no
                // longer reach 1 - threshold.
                if aborted.is_none() && failed as f64 > config.failure_threshold * total as f64 {
                    warn!(
                        failed,
                        total,
                        threshold = config.failure_threshold,
                        "Failure threshold exceeded, aborting batch"
                    );
                    aborted = Some(AbortReason::FailureThreshold {
                        failed,
                        total,
                        threshold: config.failure_threshold,
                    });
                }
            }
            Ok(None) => break,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(elapsed_ms, in_flight = in_flight.len(), "Batch timed out");
                aborted = Some(AbortReason::Timeout { elapsed_ms });
                break;
            }
        }
    }
    drop(in_flight);

    let outcomes: Vec<BatchItemOutcome<R>> = results
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| {
            let outcome = outcome.unwrap_or_else(|| {
                if index < next {
                    failed += 1;
                    ItemOutcome::Failed {
                        error: "cancelled when the batch timed out".to_string(),
                        attempts: 0,
                    }
                } else {
                    ItemOutcome::Skipped {
                        reason: "batch aborted before the item started".to_string(),
                    }
                }
            });
            BatchItemOutcome {
                id: id_of(&items[index], index),
                index,
                outcome,
            }
        })
        .collect();

    let skipped = total - succeeded - failed;
    let success_rate = if total == 0 {
        1.0
    } else {
        succeeded as f64 / total as f64
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    info!(
        total,
        succeeded,
        failed,
        skipped,
        duration_ms,
        aborted = aborted.is_some(),
        "Batch finished"
    );

    BatchSummary {
        total_items: total,
        succeeded_items: succeeded,
        failed_items: failed,
        skipped_items: skipped,
        success_rate,
        outcomes,
        aborted,
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(max_concurrency: usize, failure_threshold: f64) -> BatchConfig {
        BatchConfig {
            max_concurrency,
            failure_threshold,
            timeout: Duration::from_secs(10),
            retry_attempts: 0,
            retry_delay: Duration::from_millis(1),
            item_timeout: None,
        }
    }

    #[derive(Debug)]
    struct Permanent(&'static str);

    impl fmt::Display for Permanent {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl RetryClassify for Permanent {
        fn retry_class(&self) -> RetryableError {
            RetryableError::Permanent
        }
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));
        let items: Vec<u64> = (0..20).collect();

        let summary = process_batch(
            &items,
            |item, _| {
                let in_flight = in_flight.clone();
                let high_water = high_water.clone();
                let delay = 5 + (*item % 4) * 3;
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            },
            |item, _| item.to_string(),
            &config(3, 0.5),
        )
        .await;

        assert_eq!(summary.succeeded_items, 20);
        assert_eq!(high_water.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_threshold_aborts_early() {
        let started = Arc::new(AtomicUsize::new(0));
        let items: Vec<usize> = (0..10).collect();

        let summary = process_batch(
            &items,
            |item, _| {
                let started = started.clone();
                let item = *item;
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    if item < 6 {
                        Err(format!("item {} failed", item))
                    } else {
                        Ok(item)
                    }
                }
            },
            |item, _| format!("item-{}", item),
            &config(2, 0.5),
        )
        .await;

        assert!(matches!(
            summary.aborted,
            Some(AbortReason::FailureThreshold { .. })
        ));
        assert!(summary.failed_items >= 6);
        assert!(started.load(Ordering::SeqCst) < 10);
        assert!(summary.skipped_items > 0);
        assert_eq!(summary.outcomes.len(), 10);
        assert_eq!(
            summary.total_items,
            summary.succeeded_items + summary.failed_items + summary.skipped_items
        );
    }

    #[tokio::test]
    async fn test_outcomes_keep_submission_order() {
        let items: Vec<u64> = vec![40, 5, 25, 1];

        let summary = process_batch(
            &items,
            |delay, index| {
                let delay = *delay;
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, String>(index * 10)
                }
            },
            |delay, _| format!("d{}", delay),
            &config(4, 1.0),
        )
        .await;

        let ids: Vec<&str> = summary.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["d40", "d5", "d25", "d1"]);
        let values: Vec<usize> = summary.successes().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 10, 20, 30]);
        assert_eq!(summary.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_items_are_retried_with_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let items = vec!["flaky"];
        let mut cfg = config(1, 0.0);
        cfg.retry_attempts = 2;

        let summary = process_batch(
            &items,
            |_, _| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("done")
                    }
                }
            },
            |item, _| item.to_string(),
            &cfg,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            summary.outcomes[0].outcome,
            ItemOutcome::Succeeded {
                value: "done",
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let items = vec!["bad"];
        let mut cfg = config(1, 1.0);
        cfg.retry_attempts = 3;

        let summary = process_batch(
            &items,
            |_, _| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Permanent("invalid wallet"))
                }
            },
            |item, _| item.to_string(),
            &cfg,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.failures().next(), Some(("bad", "invalid wallet")));
    }

    #[tokio::test]
    async fn test_batch_timeout_is_a_hard_ceiling() {
        let items: Vec<usize> = (0..4).collect();
        let mut cfg = config(2, 1.0);
        cfg.timeout = Duration::from_millis(50);

        let started = Instant::now();
        let summary = process_batch(
            &items,
            |_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            },
            |_, index| index.to_string(),
            &cfg,
        )
        .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(summary.aborted, Some(AbortReason::Timeout { .. })));
        assert_eq!(summary.failed_items, 2);
        assert_eq!(summary.skipped_items, 2);
    }

    #[tokio::test]
    async fn test_item_timeout_counts_as_failure() {
        let items = vec![0];
        let mut cfg = config(1, 1.0);
        cfg.item_timeout = Some(Duration::from_millis(10));

        let summary = process_batch(
            &items,
            |_, _| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, String>(())
            },
            |_, index| index.to_string(),
            &cfg,
        )
        .await;

        assert_eq!(summary.failed_items, 1);
        assert!(summary.failures().next().unwrap().1.contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let items: Vec<u8> = Vec::new();
        let summary = process_batch(
            &items,
            |_, _| async { Ok::<_, String>(()) },
            |_, index| index.to_string(),
            &config(2, 0.5),
        )
        .await;

        assert_eq!(summary.total_items, 0);
        assert_eq!(summary.success_rate, 1.0);
        assert!(!summary.is_aborted());
    }
}
