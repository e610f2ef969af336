//! Concurrency and resource control.
//!
//! One bounded worker pool and one cancellation fabric exist per workflow
//! invocation; both are created at workflow start and torn down at the
//! end. The pool enforces the sizing policy from `sizing`; cancellation is
//! a two-stage broadcast: the soft stage asks children to terminate with
//! the usual grace period, the hard stage (a second signal) skips the
//! grace and kills immediately.
mod sizing;

pub use sizing::{
    AUTODETECT_VARS, ENV_NESTED_LEVEL, ENV_PARALLEL_INSTANCES, MAX_PARALLEL_INSTANCES, PoolPolicy,
    sanitize_instances, sanitize_nested_level,
};

use crate::error::CancelSignal;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Workflow-scoped cancellation fabric shared by the engine, every
/// worker, and the signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelControl {
    soft: CancellationToken,
    hard: CancellationToken,
    signal: Arc<Mutex<Option<CancelSignal>>>,
}

impl CancelControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// First-stage cancellation: workers SIGTERM their children and wait
    /// out the grace period.
    pub fn cancel(&self, signal: Option<CancelSignal>) {
        if let Some(signal) = signal {
            let mut slot = self.signal.lock().unwrap();
            if slot.is_none() {
                *slot = Some(signal);
            }
        }
        if self.soft.is_cancelled() {
            // Second request escalates: no more grace.
            self.hard.cancel();
        }
        self.soft.cancel();
    }

    /// Token observed at every suspension point.
    pub fn token(&self) -> CancellationToken {
        self.soft.clone()
    }

    /// Token that, once set, means "SIGKILL now".
    pub fn hard_token(&self) -> CancellationToken {
        self.hard.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.soft.is_cancelled()
    }

    /// The signal that triggered cancellation, when one did.
    pub fn signal(&self) -> Option<CancelSignal> {
        *self.signal.lock().unwrap()
    }
}

/// Semaphore-bounded worker pool used by the parallel and conditional
/// strategies.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    cancel: CancelControl,
}

impl WorkerPool {
    /// Pool of `requested` workers, capped by the sizing policy.
    pub fn new(requested: usize, policy: &PoolPolicy, cancel: CancelControl) -> Self {
        let size = policy.effective_size(requested);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            cancel,
        }
    }

    /// Effective pool size after policy capping.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }

    /// Wait for a slot. Returns `None` when the workflow is cancelled
    /// before one frees up.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        let token = self.cancel.token();
        tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
            _ = token.cancelled() => None,
        }
    }

    pub fn cancel_control(&self) -> &CancelControl {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2, &PoolPolicy::fixed(8, 1, 0), CancelControl::new());
        assert_eq!(pool.size(), 2);

        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire().await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let cancel = CancelControl::new();
        let pool = WorkerPool::new(1, &PoolPolicy::fixed(8, 1, 0), cancel.clone());
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel(Some(CancelSignal::Terminate));
        assert!(waiter.await.unwrap());
        assert_eq!(cancel.signal(), Some(CancelSignal::Terminate));
    }

    #[tokio::test]
    async fn test_second_cancel_escalates() {
        let cancel = CancelControl::new();
        assert!(!cancel.hard_token().is_cancelled());
        cancel.cancel(Some(CancelSignal::Interrupt));
        assert!(cancel.is_cancelled());
        assert!(!cancel.hard_token().is_cancelled());
        cancel.cancel(Some(CancelSignal::Interrupt));
        assert!(cancel.hard_token().is_cancelled());
        // The first signal is the one reported.
        assert_eq!(cancel.signal(), Some(CancelSignal::Interrupt));
    }

    #[tokio::test]
    async fn test_pool_size_respects_policy_cap() {
        // 4 cpus, 4 instances: recommendation (4*2)/4 = 2.
        let pool = WorkerPool::new(64, &PoolPolicy::fixed(4, 4, 0), CancelControl::new());
        assert_eq!(pool.size(), 2);
    }
}
