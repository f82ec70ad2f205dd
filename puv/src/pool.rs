//! Bounded-concurrency batch scheduler.
//!
//! Runs one operation per node in batches of at most the recommended
//! concurrency. A batch must fully finish (success, failure, or timeout)
//! before the next one starts, so peak concurrency is bounded
//! deterministically. Per-node failures are captured as values; one node
//! failing never cancels or blocks its siblings.

use puv_common::NodeFailure;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Bounded batch scheduler for per-node operations.
pub struct WorkerPool {
    batch_size: usize,
    cancel: watch::Receiver<bool>,
    op_timeout: Option<Duration>,
}

impl WorkerPool {
    /// Create a pool running at most `batch_size` operations at once.
    pub fn new(batch_size: usize, cancel: watch::Receiver<bool>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            cancel,
            op_timeout: None,
        }
    }

    /// Bound every operation by a wall-clock timeout; operations that
    /// exceed it yield a [`NodeFailure::Timeout`].
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run `op` for every item, in batches, returning one result per item
    /// in input order.
    ///
    /// When the cancel signal fires, in-flight tasks are aborted and every
    /// unfinished item is reported as [`NodeFailure::Cancelled`]; the call
    /// still returns a complete result vector.
    pub async fn run<N, T, F, Fut>(
        &self,
        operation: &str,
        items: Vec<N>,
        op: F,
    ) -> Vec<(N, Result<T, NodeFailure>)>
    where
        N: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(N) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, NodeFailure>> + Send + 'static,
    {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut cancel = self.cancel.clone();
        let mut cancelled = *cancel.borrow();
        let mut watching = true;

        let mut remaining = items.into_iter();
        let mut batch_num = 0usize;

        loop {
            let batch: Vec<N> = remaining.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            batch_num += 1;

            if cancelled {
                for item in batch {
                    results.push((item, Err(NodeFailure::Cancelled)));
                }
                continue;
            }

            debug!(
                operation,
                batch = batch_num,
                size = batch.len(),
                limit = self.batch_size,
                "dispatching batch"
            );

            let mut set = JoinSet::new();
            for (idx, item) in batch.iter().cloned().enumerate() {
                let op = op.clone();
                let op_timeout = self.op_timeout;
                let op_name = operation.to_string();
                set.spawn(async move {
                    let result = match op_timeout {
                        Some(timeout) => match tokio::time::timeout(timeout, op(item)).await {
                            Ok(result) => result,
                            Err(_) => Err(NodeFailure::Timeout {
                                operation: op_name,
                                attempts: 1,
                            }),
                        },
                        None => op(item).await,
                    };
                    (idx, result)
                });
            }

            let mut slots: Vec<Option<Result<T, NodeFailure>>> =
                (0..batch.len()).map(|_| None).collect();

            loop {
                tokio::select! {
                    joined = set.join_next() => {
                        match joined {
                            Some(Ok((idx, result))) => slots[idx] = Some(result),
                            Some(Err(join_err)) => {
                                // Aborted tasks land here after a cancel;
                                // panics lose their index and fall through
                                // to the placeholder fill below.
                                if !join_err.is_cancelled() {
                                    warn!(operation, error = %join_err, "worker task panicked");
                                }
                            }
                            None => break,
                        }
                    }
                    changed = cancel.changed(), if watching && !cancelled => {
                        match changed {
                            Ok(()) if *cancel.borrow() => {
                                warn!(operation, "cancellation requested, aborting batch");
                                cancelled = true;
                                set.abort_all();
                            }
                            Ok(()) => {}
                            Err(_) => watching = false,
                        }
                    }
                }
            }

            for (item, slot) in batch.into_iter().zip(slots) {
                let result = slot.unwrap_or_else(|| {
                    if cancelled {
                        Err(NodeFailure::Cancelled)
                    } else {
                        Err(NodeFailure::Command {
                            operation: operation.to_string(),
                            reason: "worker task panicked".into(),
                        })
                    }
                });
                results.push((item, result));
            }
        }

        debug!(operation, total, batches = batch_num, "pool run complete");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test process.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_batch_size() {
        let limit = 3;
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::new(limit, no_cancel());
        let items: Vec<usize> = (0..11).collect();

        let (current_c, peak_c) = (current.clone(), peak.clone());
        let results = pool
            .run("instrumented", items, move |n: usize| {
                let current = current_c.clone();
                let peak = peak_c.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<usize, NodeFailure>(n * 2)
                }
            })
            .await;

        assert_eq!(results.len(), 11);
        assert!(peak.load(Ordering::SeqCst) <= limit);
        for (n, result) in results {
            assert_eq!(result.unwrap(), n * 2);
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_block_siblings() {
        let pool = WorkerPool::new(3, no_cancel());
        let items = vec!["node-a", "node-b", "node-c"];

        let results = pool
            .run("mixed", items, |name: &'static str| async move {
                if name == "node-b" {
                    Err(NodeFailure::Connection {
                        host: name.into(),
                        reason: "refused".into(),
                    })
                } else {
                    Ok(name.len())
                }
            })
            .await;

        let ok: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
        let failed: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).collect();
        assert_eq!(ok.len(), 2);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "node-b");
    }

    #[tokio::test]
    async fn results_preserve_input_order() {
        let pool = WorkerPool::new(2, no_cancel());
        let items: Vec<u64> = vec![30, 10, 20, 5];

        let results = pool
            .run("ordering", items.clone(), |n: u64| async move {
                // Finish out of order within the batch.
                tokio::time::sleep(Duration::from_millis(n)).await;
                Ok::<u64, NodeFailure>(n)
            })
            .await;

        let order: Vec<u64> = results.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, items);
    }

    #[tokio::test]
    async fn cancel_marks_pending_items_cancelled() {
        let (tx, rx) = watch::channel(false);
        let pool = WorkerPool::new(2, rx);
        let items: Vec<usize> = (0..6).collect();

        let started = Arc::new(AtomicUsize::new(0));
        let started_c = started.clone();
        let handle = tokio::spawn(async move {
            pool.run("cancellable", items, move |n| {
                let started = started_c.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<usize, NodeFailure>(n)
                }
            })
            .await
        });

        // Let the first batch start, then cancel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let results = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pool must not hang after cancel")
            .unwrap();

        assert_eq!(results.len(), 6);
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, Err(NodeFailure::Cancelled))));
        // Only the first batch ever started.
        assert!(started.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn op_timeout_yields_timeout_failure() {
        let pool = WorkerPool::new(2, no_cancel()).with_op_timeout(Duration::from_millis(30));
        let items = vec![1u32, 2u32];

        let results = pool
            .run("slow", items, |n: u32| async move {
                if n == 1 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<u32, NodeFailure>(n)
            })
            .await;

        assert!(matches!(
            results[0].1,
            Err(NodeFailure::Timeout { .. })
        ));
        assert_eq!(*results[1].1.as_ref().unwrap(), 2);
    }

    #[test]
    fn batch_bound_holds_for_arbitrary_sizes() {
        use proptest::prelude::*;

        proptest!(ProptestConfig::with_cases(16), |(limit in 1usize..6, count in 0usize..20)| {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_time()
                .build()
                .unwrap();

            let peak = Arc::new(AtomicUsize::new(0));
            let current = Arc::new(AtomicUsize::new(0));
            let (peak_c, current_c) = (peak.clone(), current.clone());

            let results = runtime.block_on(async move {
                let pool = WorkerPool::new(limit, no_cancel());
                pool.run("prop", (0..count).collect::<Vec<usize>>(), move |n| {
                    let peak = peak_c.clone();
                    let current = current_c.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<usize, NodeFailure>(n)
                    }
                })
                .await
            });

            prop_assert_eq!(results.len(), count);
            prop_assert!(peak.load(Ordering::SeqCst) <= limit.max(1));
        });
    }
}
