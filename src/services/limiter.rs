use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::models::job::JobWeight;

/// Two independent admission gates, one per job weight, so that a burst of cheap
/// url/image jobs cannot starve video jobs and vice versa.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    heavy: Arc<Semaphore>,
    light: Arc<Semaphore>,
    heavy_capacity: usize,
    light_capacity: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("Concurrency limiter closed")]
pub struct LimiterClosed;

impl ConcurrencyLimiter {
    pub fn new(heavy_capacity: usize, light_capacity: usize) -> Self {
        let heavy_capacity = heavy_capacity.max(1);
        let light_capacity = light_capacity.max(1);
        Self {
            heavy: Arc::new(Semaphore::new(heavy_capacity)),
            light: Arc::new(Semaphore::new(light_capacity)),
            heavy_capacity,
            light_capacity,
        }
    }

    fn gate(&self, weight: JobWeight) -> &Arc<Semaphore> {
        match weight {
            JobWeight::Heavy => &self.heavy,
            JobWeight::Light => &self.light,
        }
    }

    /// Wait for a slot. The permit is released when dropped.
    ///
    /// Callers bound the wait themselves (deadline, cancellation); acquisition order
    /// between waiters is not guaranteed.
    pub async fn acquire(&self, weight: JobWeight) -> Result<OwnedSemaphorePermit, LimiterClosed> {
        self.gate(weight)
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)
    }

    pub fn available(&self, weight: JobWeight) -> usize {
        self.gate(weight).available_permits()
    }

    pub fn capacity(&self, weight: JobWeight) -> usize {
        match weight {
            JobWeight::Heavy => self.heavy_capacity,
            JobWeight::Light => self.light_capacity,
        }
    }

    pub fn in_use(&self, weight: JobWeight) -> usize {
        self.capacity(weight) - self.available(weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn gates_are_independent() {
        let limiter = ConcurrencyLimiter::new(1, 2);
        let _heavy = limiter.acquire(JobWeight::Heavy).await.unwrap();
        assert_eq!(limiter.available(JobWeight::Heavy), 0);

        // Light jobs are unaffected by a saturated heavy gate.
        let _light = tokio::time::timeout(Duration::from_millis(50), limiter.acquire(JobWeight::Light))
            .await
            .expect("light gate should be free")
            .unwrap();
        assert_eq!(limiter.in_use(JobWeight::Light), 1);
    }

    #[tokio::test]
    async fn waiter_blocks_until_release() {
        let limiter = ConcurrencyLimiter::new(1, 1);
        let permit = limiter.acquire(JobWeight::Heavy).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire(JobWeight::Heavy)).await;
        assert!(blocked.is_err());

        drop(permit);
        let next = tokio::time::timeout(Duration::from_millis(50), limiter.acquire(JobWeight::Heavy)).await;
        assert!(next.is_ok());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let limiter = ConcurrencyLimiter::new(0, 0);
        assert_eq!(limiter.capacity(JobWeight::Heavy), 1);
        assert_eq!(limiter.capacity(JobWeight::Light), 1);
    }
}
