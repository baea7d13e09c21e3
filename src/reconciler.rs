//! Edge-triggered "something changed" signal collapsed into a single
//! level-triggered convergence pass, with rate-limited retry.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_CAP: Duration = Duration::from_secs(1000);

/// Coalescing reconcile trigger. [`Notify`] stores at most one permit
/// while no worker is waiting, which is exactly the dirty sentinel: any
/// number of [`dirty`](DirtyReconciler::dirty) calls during an in-flight
/// pass collapse into a single follow-up pass.
pub struct DirtyReconciler {
    name: &'static str,
    notify: Notify,
    dirtied: AtomicU64,
}

impl DirtyReconciler {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        DirtyReconciler {
            name,
            notify: Notify::new(),
            dirtied: AtomicU64::new(0),
        }
    }

    /// Mark the world changed; the worker will run another pass.
    pub fn dirty(&self) {
        trace!(reconciler = self.name, "marked dirty");
        self.dirtied.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Number of times [`dirty`](Self::dirty) has been called.
    #[must_use]
    pub fn dirtied(&self) -> u64 {
        self.dirtied.load(Ordering::Relaxed)
    }

    /// Worker loop: waits until dirty, then drives `reconcile` to
    /// success with exponential back-off between failed attempts.
    /// Returns once `stop` is cancelled.
    pub async fn run<F, Fut, E>(&self, mut reconcile: F, stop: CancellationToken)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        loop {
            tokio::select! {
                () = stop.cancelled() => return,
                () = self.notify.notified() => {}
            }

            let mut failures = 0_u32;
            loop {
                match reconcile().await {
                    Ok(()) => {
                        trace!(reconciler = self.name, "reconciled");
                        break;
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(
                            reconciler = self.name,
                            "reconcile failed (attempt {failures}): {err}"
                        );
                        tokio::select! {
                            () = stop.cancelled() => return,
                            () = sleep(backoff(failures)) => {}
                        }
                    }
                }
            }
        }
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(24);
    BACKOFF_BASE
        .saturating_mul(2_u32.saturating_pow(exp))
        .min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn backoff_grows_exponentially_to_the_cap() {
        assert_eq!(backoff(1), Duration::from_millis(5));
        assert_eq!(backoff(2), Duration::from_millis(10));
        assert_eq!(backoff(5), Duration::from_millis(80));
        assert_eq!(backoff(64), BACKOFF_CAP);
    }

    #[tokio::test]
    async fn bursts_coalesce_into_one_follow_up_pass() {
        let reconciler = Arc::new(DirtyReconciler::new("test"));
        let passes = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());

        let stop = CancellationToken::new();
        let worker = {
            let reconciler = Arc::clone(&reconciler);
            let passes = Arc::clone(&passes);
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            let stop = stop.clone();
            tokio::spawn(async move {
                reconciler
                    .run(
                        move || {
                            let passes = Arc::clone(&passes);
                            let gate = Arc::clone(&gate);
                            let entered = Arc::clone(&entered);
                            async move {
                                passes.fetch_add(1, Ordering::SeqCst);
                                entered.notify_one();
                                gate.notified().await;
                                Ok::<(), String>(())
                            }
                        },
                        stop,
                    )
                    .await;
            })
        };

        // First pass is in flight; fire a burst of dirties at it.
        reconciler.dirty();
        entered.notified().await;
        for _ in 0..100 {
            reconciler.dirty();
        }
        gate.notify_one();

        // Exactly one follow-up pass runs.
        entered.notified().await;
        gate.notify_one();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 2);

        stop.cancel();
        gate.notify_one();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn failures_retry_until_success() {
        let reconciler = Arc::new(DirtyReconciler::new("test"));
        let attempts = Arc::new(AtomicUsize::new(0));

        let stop = CancellationToken::new();
        let worker = {
            let reconciler = Arc::clone(&reconciler);
            let attempts = Arc::clone(&attempts);
            let stop = stop.clone();
            tokio::spawn(async move {
                reconciler
                    .run(
                        move || {
                            let n = attempts.fetch_add(1, Ordering::SeqCst);
                            async move {
                                if n < 2 {
                                    Err("transient".to_owned())
                                } else {
                                    Ok(())
                                }
                            }
                        },
                        stop,
                    )
                    .await;
            })
        };

        reconciler.dirty();
        for _ in 0..500 {
            if attempts.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        stop.cancel();
        worker.await.unwrap();
    }
}
