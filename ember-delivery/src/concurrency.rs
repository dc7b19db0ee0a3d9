//! Per-account concurrency limiting for the per-send workers
//!
//! Each account gets a semaphore whose size is recomputed from its current
//! send rate on every dispatch batch. Acquiring blocks, so surplus send jobs
//! queue behind the permits instead of being dropped.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;
use ember_common::tracing;
use ember_store::AccountId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{DeliveryError, SystemError};

#[derive(Debug)]
struct TenantSlot {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    /// Permits to retire as they come back after a shrink
    debt: AtomicUsize,
}

impl TenantSlot {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            debt: AtomicUsize::new(0),
        }
    }

    fn take_debt(&self) -> bool {
        self.debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                debt.checked_sub(1)
            })
            .is_ok()
    }
}

/// Resizable per-account semaphores
#[derive(Debug, Default)]
pub struct TenantLimiter {
    slots: DashMap<AccountId, Arc<TenantSlot>>,
}

impl TenantLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, account: &AccountId, limit: usize) -> Arc<TenantSlot> {
        self.slots
            .entry(*account)
            .or_insert_with(|| Arc::new(TenantSlot::new(limit.max(1))))
            .clone()
    }

    /// Set the number of concurrent sends allowed for an account.
    ///
    /// Growing takes effect immediately. Shrinking retires idle permits now
    /// and the rest as in-flight sends finish.
    pub fn resize(&self, account: &AccountId, limit: usize) {
        let limit = limit.max(1);
        let slot = self.slot(account, limit);
        let previous = slot.limit.swap(limit, Ordering::AcqRel);

        if limit > previous {
            let mut grow = limit - previous;
            // cancel outstanding shrink debt before adding permits
            while grow > 0 && slot.take_debt() {
                grow -= 1;
            }
            slot.semaphore.add_permits(grow);
        } else if limit < previous {
            let shrink = previous - limit;
            let retired = slot.semaphore.forget_permits(shrink);
            slot.debt.fetch_add(shrink - retired, Ordering::AcqRel);
        } else {
            return;
        }

        tracing::debug!(account_id = %account, previous, limit, "Resized account concurrency");
    }

    /// Wait for a send slot for the account
    ///
    /// # Errors
    ///
    /// Fails only if the semaphore has been closed.
    pub async fn acquire(
        &self,
        account: &AccountId,
        limit: usize,
    ) -> Result<OwnedSemaphorePermit, DeliveryError> {
        let slot = self.slot(account, limit);

        loop {
            let permit = slot
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SystemError::Internal(format!("Account semaphore closed: {e}")))?;

            if slot.take_debt() {
                permit.forget();
                continue;
            }

            return Ok(permit);
        }
    }

    /// Current concurrency limit for an account, if it has been seen
    #[must_use]
    pub fn limit(&self, account: &AccountId) -> Option<usize> {
        self.slots
            .get(account)
            .map(|slot| slot.limit.load(Ordering::Acquire))
    }

    /// Permits not currently held for an account
    #[must_use]
    pub fn available(&self, account: &AccountId) -> Option<usize> {
        self.slots
            .get(account)
            .map(|slot| slot.semaphore.available_permits())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_acquire_blocks_at_limit() {
        let limiter = Arc::new(TenantLimiter::new());
        let account = AccountId::generate();
        limiter.resize(&account, 2);

        let first = limiter.acquire(&account, 2).await.unwrap();
        let _second = limiter.acquire(&account, 2).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            limiter.acquire(&account, 2),
        )
        .await;
        assert!(blocked.is_err());

        drop(first);
        assert!(limiter.acquire(&account, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_grow_and_shrink() {
        let limiter = TenantLimiter::new();
        let account = AccountId::generate();

        limiter.resize(&account, 1);
        limiter.resize(&account, 4);
        assert_eq!(limiter.limit(&account), Some(4));
        assert_eq!(limiter.available(&account), Some(4));

        let held: Vec<_> = {
            let mut held = Vec::new();
            for _ in 0..3 {
                held.push(limiter.acquire(&account, 4).await.unwrap());
            }
            held
        };

        // one idle permit is retired now, the other two once returned
        limiter.resize(&account, 1);
        assert_eq!(limiter.available(&account), Some(0));
        drop(held);
        assert_eq!(limiter.available(&account), Some(3));

        let _only = limiter.acquire(&account, 1).await.unwrap();
        assert_eq!(limiter.available(&account), Some(0));
    }

    #[test]
    fn test_limit_is_at_least_one() {
        let limiter = TenantLimiter::new();
        let account = AccountId::generate();
        limiter.resize(&account, 0);
        assert_eq!(limiter.limit(&account), Some(1));
    }
}
