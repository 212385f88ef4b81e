//! Bounded concurrency control for in-flight pipeline runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyStats {
    pub max_concurrent: usize,
    pub current_running: usize,
    pub available: usize,
}

/// A cancellation-safe bounded gate over `max_concurrent` simultaneous
/// pipeline runs, built on a `tokio::sync::Semaphore`. `acquire` is dropped
/// cleanly if the caller's future is cancelled before a permit is granted,
/// so a cancelled acquire never consumes a permit.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    current_running: Arc<AtomicUsize>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            current_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot and returns a guard that releases it on drop,
    /// including on panic unwind.
    pub async fn acquire(&self) -> PermitGuard {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("ConcurrencyGate semaphore is never closed");
        self.current_running.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            current_running = self.current_running.load(Ordering::SeqCst),
            max_concurrent = self.max_concurrent,
            "acquired concurrency permit"
        );
        PermitGuard {
            _permit: permit,
            current_running: Arc::clone(&self.current_running),
        }
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let current_running = self.current_running.load(Ordering::SeqCst);
        ConcurrencyStats {
            max_concurrent: self.max_concurrent,
            current_running,
            available: self.max_concurrent.saturating_sub(current_running),
        }
    }
}

/// RAII permit. Its `Drop` impl decrements the running counter defensively
/// (never below zero) before releasing the underlying semaphore permit.
pub struct PermitGuard {
    _permit: OwnedSemaphorePermit,
    current_running: Arc<AtomicUsize>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        let prev = self
            .current_running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            });
        if prev.is_err() {
            tracing::warn!("released a concurrency permit but counter was already 0");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn limits_concurrent_holders_to_max() {
        let gate = ConcurrencyGate::new(2);
        let g1 = gate.acquire().await;
        let g2 = gate.acquire().await;
        assert_eq!(gate.stats().current_running, 2);
        assert_eq!(gate.stats().available, 0);

        let gate2 = gate.clone();
        let third = tokio::spawn(async move { gate2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        drop(g1);
        let g3 = tokio::time::timeout(Duration::from_millis(200), third)
            .await
            .expect("third acquire should unblock after a release")
            .expect("task should not panic");
        assert_eq!(gate.stats().current_running, 2);
        drop(g2);
        drop(g3);
        assert_eq!(gate.stats().current_running, 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_consumes_no_permit() {
        let gate = ConcurrencyGate::new(1);
        let g1 = gate.acquire().await;

        let gate2 = gate.clone();
        let fut = gate2.acquire();
        tokio::pin!(fut);
        tokio::select! {
            _ = &mut fut => panic!("acquire should not complete while held"),
            () = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        drop(fut);
        assert_eq!(gate.stats().current_running, 1);
        drop(g1);
        assert_eq!(gate.stats().current_running, 0);
    }

    #[tokio::test]
    async fn release_on_panic_unwind_still_frees_the_permit() {
        let gate = ConcurrencyGate::new(1);
        let gate2 = gate.clone();
        let result = tokio::spawn(async move {
            let _guard = gate2.acquire().await;
            panic!("boom");
        })
        .await;
        assert!(result.is_err());
        assert_eq!(gate.stats().current_running, 0);
        let _g = gate.acquire().await;
    }
}
