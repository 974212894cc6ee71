//! Counting permit primitive used for the global and per-host fetch caps.
//!
//! Thin wrapper over `tokio::sync::Semaphore` that tracks capacity so the
//! scheduler and telemetry can read how many permits are currently held.
//! Permits are RAII: dropping an [`OwnedSemaphorePermit`] releases exactly
//! once on every exit path, and over-release is impossible by construction.

use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

#[derive(Clone, Debug)]
pub struct Semaphore {
    inner: Arc<tokio::sync::Semaphore>,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(tokio::sync::Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit. Returns `None` only if the semaphore is closed,
    /// which this crate never does.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.clone().acquire_owned().await.ok()
    }

    /// Non-blocking acquire; `None` when all permits are held.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.clone().try_acquire_owned().ok()
    }

    /// Number of permits currently held.
    pub fn inflight(&self) -> usize {
        self.capacity.saturating_sub(self.inner.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_respects_capacity() {
        let sem = Semaphore::new(2);
        let a = sem.try_acquire();
        let b = sem.try_acquire();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(sem.try_acquire().is_none());
        assert_eq!(sem.inflight(), 2);

        drop(a);
        assert_eq!(sem.inflight(), 1);
        assert!(sem.try_acquire().is_some());
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.capacity(), 1);
        assert!(sem.try_acquire().is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let sem = Semaphore::new(1);
        let held = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        drop(held);
        assert!(sem.acquire().await.is_some());
    }
}
