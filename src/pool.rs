use std::{sync::Arc, time::Duration};

use tokio::sync::Semaphore;

/// Bounded admission gate for handler execution. Owns no tasks; the
/// receiver acquires a slot before dequeueing and the worker releases it
/// after execution, so a saturated pool stops the queue from draining.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> WorkerPool {
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Obtain one slot. A non-blocking acquire reports failure immediately;
    /// a blocking acquire waits for a release, or until `timeout` elapses.
    pub async fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        if !blocking {
            return self.try_acquire();
        }

        match timeout {
            Some(wait) => match tokio::time::timeout(wait, self.semaphore.acquire()).await {
                Ok(Ok(permit)) => {
                    permit.forget();
                    true
                }
                _ => false,
            },
            None => match self.semaphore.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
        }
    }

    pub fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Return one slot. Callers must hold a slot; the pool does not check.
    pub fn release(&self) {
        self.semaphore.add_permits(1);
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slots_are_exhaustible_and_returnable() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.capacity(), 2);

        assert!(pool.acquire(false, None).await);
        assert!(pool.acquire(false, None).await);
        assert_eq!(pool.available(), 0);
        assert!(!pool.try_acquire());

        pool.release();
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_times_out() {
        let pool = WorkerPool::new(1);
        assert!(pool.acquire(true, None).await);

        assert!(!pool.acquire(true, Some(Duration::from_millis(50))).await);

        pool.release();
        assert!(pool.acquire(true, Some(Duration::from_millis(50))).await);
    }
}
