//! L4: bounded-concurrency parallel executor (spec.md §4 L4).
//!
//! Used by the capability aggregator (A1) to fan out `tools/list` (and
//! friends) across every connected child without letting one slow child
//! block the others, and by the async loading orchestrator (A2) to batch
//! `listChanged` notifications after a burst of children finish connecting.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcome of one item in a batch: either its result or why it failed.
#[derive(Debug, Clone)]
pub enum ItemOutcome<T> {
    Ok(T),
    Err(String),
}

impl<T> ItemOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            ItemOutcome::Ok(v) => Some(v),
            ItemOutcome::Err(_) => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ItemOutcome::Ok(_))
    }
}

/// Result of running a batch: per-item outcomes in input order, plus counts.
#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    pub outcomes: Vec<ItemOutcome<T>>,
}

impl<T> BatchResult<T> {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Just the successful values, input order preserved, failures dropped.
    pub fn oks(self) -> Vec<T> {
        self.outcomes.into_iter().filter_map(ItemOutcome::ok).collect()
    }
}

/// Run `f(item)` for every item in `items`, at most `max_concurrency` at a
/// time. Each future's error is captured as `ItemOutcome::Err` rather than
/// aborting the batch — one failing child must never prevent the others'
/// results from being aggregated (spec.md's "partial aggregation" behavior
/// for A1/A2).
pub async fn run_bounded<I, T, F, Fut>(
    items: Vec<I>,
    max_concurrency: usize,
    f: F,
) -> BatchResult<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send,
{
    let max_concurrency = max_concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let f = Arc::new(f);
    let mut set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let f = Arc::clone(&f);
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore is never closed while tasks are outstanding");
            let outcome = match f(item).await {
                Ok(value) => ItemOutcome::Ok(value),
                Err(reason) => ItemOutcome::Err(reason),
            };
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<ItemOutcome<T>>> = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (index, outcome) = joined.expect("spawned task does not panic under normal operation");
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        slots[index] = Some(outcome);
    }

    BatchResult {
        outcomes: slots.into_iter().map(|s| s.expect("every index was spawned exactly once")).collect(),
    }
}

/// Accumulates per-child completions and decides when to flush a batched
/// `listChanged` notification: either the whole cohort finished, or a
/// debounce window elapsed since the last completion (A2's batching rule).
pub struct BatchAccumulator {
    expected: usize,
    completed: usize,
}

impl BatchAccumulator {
    pub fn new(expected: usize) -> Self {
        Self { expected, completed: 0 }
    }

    /// Record one completion; returns `true` if the cohort is now fully done.
    pub fn complete_one(&mut self) -> bool {
        self.completed = (self.completed + 1).min(self.expected);
        self.is_done()
    }

    pub fn is_done(&self) -> bool {
        self.completed >= self.expected
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.completed, self.expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_all_items_and_preserves_order() {
        let items = vec![1, 2, 3, 4];
        let result = run_bounded(items, 2, |n| async move { Ok::<_, String>(n * 10) }).await;
        let values = result.oks();
        assert_eq!(values, vec![10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn one_failure_does_not_drop_other_results() {
        let items = vec![1, 2, 3];
        let result = run_bounded(items, 4, |n| async move {
            if n == 2 {
                Err("boom".to_string())
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
    }

    #[tokio::test]
    async fn respects_concurrency_cap() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let inflight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let items: Vec<usize> = (0..8).collect();
        let inflight_clone = Arc::clone(&inflight);
        let max_seen_clone = Arc::clone(&max_seen);
        run_bounded(items, 3, move |_| {
            let inflight = Arc::clone(&inflight_clone);
            let max_seen = Arc::clone(&max_seen_clone);
            async move {
                let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        })
        .await;
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn batch_accumulator_reports_done_at_expected_count() {
        let mut acc = BatchAccumulator::new(3);
        assert!(!acc.complete_one());
        assert!(!acc.complete_one());
        assert!(acc.complete_one());
        assert!(acc.is_done());
    }
}
