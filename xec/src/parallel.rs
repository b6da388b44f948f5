//! # Parallel Combinator
//!
//! Fan-out helpers over a sequence of fallible async operations with an optional
//! concurrency cap (§4.10), grounded on the pack's shell-pool semaphore gate: a
//! bounded number of permits taken before each task starts, released on drop.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Shared tuning knobs for the fan-out combinators.
#[derive(Clone, Default)]
pub struct ParallelOptions {
    /// `None` means unlimited concurrency.
    pub max_concurrency: Option<usize>,
    /// Invoked after each completion with `(completed, total, succeeded, failed)`.
    pub on_progress: Option<Arc<dyn Fn(usize, usize, usize, usize) + Send + Sync>>,
}

impl std::fmt::Debug for ParallelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl ParallelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(usize, usize, usize, usize) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

/// The outcome of [`settled`]: every slot's result, plus its indices split by
/// success/failure, preserving input order throughout.
pub struct Settled<R> {
    pub results: Vec<Result<R, Error>>,
    pub succeeded: Vec<usize>,
    pub failed: Vec<usize>,
    pub duration: Duration,
}

/// Awaits every operation, fails fast on the first error and cancels the rest via
/// the [`CancellationToken`] passed into `op` — `op` is responsible for observing
/// it (e.g. by wiring it into [`crate::command::Command::cancellation`]).
pub async fn all<T, F, Fut, R>(items: Vec<T>, op: F, options: ParallelOptions) -> Result<Vec<R>, Error>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let cancellation = CancellationToken::new();
    let semaphore = options.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
    let op = Arc::new(op);

    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let semaphore = semaphore.clone();
        let op = op.clone();
        let cancellation = cancellation.clone();
        handles.push(tokio::spawn(async move {
            let _permit = acquire(&semaphore).await;
            op(item, cancellation).await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(err)) => {
                if first_error.is_none() {
                    cancellation.cancel();
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    cancellation.cancel();
                    first_error = Some(Error::Cancelled { command: join_err.to_string() });
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}

/// Awaits every operation to completion regardless of individual failures.
pub async fn settled<T, F, Fut, R>(items: Vec<T>, op: F, options: ParallelOptions) -> Settled<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let start = Instant::now();
    let total = items.len();
    let semaphore = options.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
    let op = Arc::new(op);
    let completed = Arc::new(AtomicUsize::new(0));
    let succeeded_count = Arc::new(AtomicUsize::new(0));
    let failed_count = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(total);
    for item in items {
        let semaphore = semaphore.clone();
        let op = op.clone();
        let completed = completed.clone();
        let succeeded_count = succeeded_count.clone();
        let failed_count = failed_count.clone();
        let on_progress = options.on_progress.clone();
        handles.push(tokio::spawn(async move {
            let _permit = acquire(&semaphore).await;
            let result = op(item).await;
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            if result.is_ok() {
                succeeded_count.fetch_add(1, Ordering::SeqCst);
            } else {
                failed_count.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(callback) = &on_progress {
                callback(
                    done,
                    total,
                    succeeded_count.load(Ordering::SeqCst),
                    failed_count.load(Ordering::SeqCst),
                );
            }
            result
        }));
    }

    let mut results = Vec::with_capacity(total);
    for handle in handles {
        results.push(handle.await.unwrap_or_else(|err| {
            Err(Error::Cancelled {
                command: err.to_string(),
            })
        }));
    }

    let succeeded = results.iter().enumerate().filter(|(_, r)| r.is_ok()).map(|(i, _)| i).collect();
    let failed = results.iter().enumerate().filter(|(_, r)| r.is_err()).map(|(i, _)| i).collect();

    Settled {
        results,
        succeeded,
        failed,
        duration: start.elapsed(),
    }
}

/// Resolves with the first operation to settle (success or failure) and cancels the
/// rest.
pub async fn race<T, F, Fut, R>(items: Vec<T>, op: F) -> Result<R, Error>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let cancellation = CancellationToken::new();
    let op = Arc::new(op);
    let mut set = JoinSet::new();
    for item in items {
        let op = op.clone();
        let cancellation = cancellation.clone();
        set.spawn(async move { op(item, cancellation).await });
    }

    let outcome = match set.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(join_err)) => Err(Error::Cancelled {
            command: join_err.to_string(),
        }),
        None => Err(Error::Cancelled {
            command: "race: no branches to run".to_string(),
        }),
    };

    cancellation.cancel();
    set.abort_all();
    outcome
}

/// `settled`, but fails fast (returns the first error encountered in input order)
/// instead of collecting every outcome.
pub async fn map<T, F, Fut, R>(items: Vec<T>, op: F, options: ParallelOptions) -> Result<Vec<R>, Error>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let settled = settled(items, op, options).await;
    let mut mapped = Vec::with_capacity(settled.results.len());
    for result in settled.results {
        mapped.push(result?);
    }
    Ok(mapped)
}

/// Keeps items whose predicate resolves `true`, preserving input order. The first
/// predicate error encountered (in input order) short-circuits the whole call.
pub async fn filter<T, F, Fut>(items: Vec<T>, predicate: F, options: ParallelOptions) -> Result<Vec<T>, Error>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, Error>> + Send + 'static,
{
    let probe_items = items.clone();
    let settled = settled(probe_items, predicate, options).await;

    let mut kept = Vec::new();
    for (index, result) in settled.results.into_iter().enumerate() {
        match result {
            Ok(true) => kept.push(items[index].clone()),
            Ok(false) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(kept)
}

/// `true` as soon as any predicate resolves `true`; a predicate error counts as `false`.
pub async fn some<T, F, Fut>(items: Vec<T>, predicate: F) -> bool
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, Error>> + Send + 'static,
{
    let predicate = Arc::new(predicate);
    let mut set = JoinSet::new();
    for item in items {
        let predicate = predicate.clone();
        set.spawn(async move { predicate(item).await.unwrap_or(false) });
    }
    while let Some(result) = set.join_next().await {
        if matches!(result, Ok(true)) {
            set.abort_all();
            return true;
        }
    }
    false
}

/// `true` only if every predicate resolves `true`; a predicate error counts as `false`.
pub async fn every<T, F, Fut>(items: Vec<T>, predicate: F) -> bool
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, Error>> + Send + 'static,
{
    let predicate = Arc::new(predicate);
    let mut set = JoinSet::new();
    for item in items {
        let predicate = predicate.clone();
        set.spawn(async move { predicate(item).await.unwrap_or(false) });
    }
    while let Some(result) = set.join_next().await {
        if !matches!(result, Ok(true)) {
            set.abort_all();
            return false;
        }
    }
    true
}

async fn acquire(semaphore: &Option<Arc<Semaphore>>) -> Option<tokio::sync::OwnedSemaphorePermit> {
    match semaphore {
        Some(sem) => Some(sem.clone().acquire_owned().await.expect("semaphore is never closed")),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn ok_after(value: u32, fail: bool) -> impl Future<Output = Result<u32, Error>> {
        async move {
            if fail {
                Err(Error::AdapterFailure {
                    adapter: "local".to_string(),
                    operation: "test".to_string(),
                    reason: "boom".to_string(),
                })
            } else {
                Ok(value)
            }
        }
    }

    #[tokio::test]
    async fn all_collects_results_in_order() {
        let items = vec![1, 2, 3];
        let result = all(items, |n, _token| ok_after(n * 10, false), ParallelOptions::new()).await;
        assert_eq!(result.unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn all_fails_fast_on_first_error() {
        let items = vec![1, 2, 3];
        let result = all(items, |n, _token| ok_after(n, n == 2), ParallelOptions::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn settled_preserves_order_and_splits_success_failure() {
        let items = vec![1, 2, 3];
        let result = settled(items, |n| ok_after(n, n == 2), ParallelOptions::new()).await;
        assert_eq!(result.succeeded, vec![0, 2]);
        assert_eq!(result.failed, vec![1]);
        assert_eq!(*result.results[0].as_ref().unwrap(), 1);
        assert_eq!(*result.results[2].as_ref().unwrap(), 3);
    }

    #[tokio::test]
    async fn settled_respects_max_concurrency() {
        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let items: Vec<u32> = (0..6).collect();
        let active_clone = active.clone();
        let max_seen_clone = max_seen.clone();
        let result = settled(
            items,
            move |_n| {
                let active = active_clone.clone();
                let max_seen = max_seen_clone.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            },
            ParallelOptions::new().max_concurrency(2),
        )
        .await;
        assert_eq!(result.succeeded.len(), 6);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn race_returns_first_settled() {
        let items = vec![20u64, 5u64];
        let result = race(items, |n, _token| async move {
            tokio::time::sleep(Duration::from_millis(n)).await;
            Ok::<_, Error>(n)
        })
        .await;
        assert_eq!(result.unwrap(), 5);
    }

    #[tokio::test]
    async fn filter_keeps_only_matching_items_in_order() {
        let items = vec![1, 2, 3, 4];
        let result = filter(items, |n| async move { Ok::<_, Error>(n % 2 == 0) }, ParallelOptions::new()).await;
        assert_eq!(result.unwrap(), vec![2, 4]);
    }

    #[tokio::test]
    async fn some_and_every_short_circuit() {
        let items = vec![1, 2, 3];
        assert!(some(items.clone(), |n| async move { Ok::<_, Error>(n == 2) }).await);
        assert!(!every(items, |n| async move { Ok::<_, Error>(n < 3) }).await);
    }
}
