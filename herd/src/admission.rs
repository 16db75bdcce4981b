//! Admission control for concurrent sessions.
//!
//! A counting semaphore bounds how many sessions may be open at once. Each
//! acquired slot is an RAII [`AdmissionSlot`]; dropping it returns the
//! permits, so a slot cannot leak on an error path and releasing twice is
//! impossible.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HerdError, Result};

/// Fixed-capacity gate that every session passes through before spawning.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Permits held by one admitted caller.
#[derive(Debug)]
pub struct AdmissionSlot {
    permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    /// Number of permits this slot holds.
    pub fn size(&self) -> u32 {
        u32::try_from(self.permit.num_permits()).unwrap_or(u32::MAX)
    }

    /// Return the permits now instead of at drop.
    pub fn release(self) {
        debug!(permits = self.size(), "releasing admission slot");
        drop(self.permit);
    }
}

impl AdmissionGate {
    /// Create a gate admitting at most `capacity` concurrent holders.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for `n` permits.
    ///
    /// Fails with [`HerdError::AdmissionTimeout`] when `timeout` elapses and
    /// with [`HerdError::Cancelled`] when `cancel` fires first. Permits are
    /// taken all at once, so a cancelled wait never holds a partial set.
    pub async fn acquire(
        &self,
        n: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AdmissionSlot> {
        let acquire = self.semaphore.clone().acquire_many_owned(n);
        tokio::select! {
            () = cancel.cancelled() => Err(HerdError::Cancelled),
            res = tokio::time::timeout(timeout, acquire) => match res {
                Ok(Ok(permit)) => Ok(AdmissionSlot { permit }),
                Ok(Err(_closed)) => Err(HerdError::ShuttingDown),
                Err(_elapsed) => Err(HerdError::AdmissionTimeout(timeout)),
            },
        }
    }

    /// Take `n` permits only if they are free right now.
    pub fn try_acquire(&self, n: u32) -> Option<AdmissionSlot> {
        self.semaphore
            .clone()
            .try_acquire_many_owned(n)
            .ok()
            .map(|permit| AdmissionSlot { permit })
    }

    /// Stop admitting; pending and future acquisitions fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured capacity.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_gate_basic() {
        let gate = AdmissionGate::new(2);
        let cancel = CancellationToken::new();

        let slot = gate.acquire(1, WAIT, &cancel).await.unwrap();
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.in_use(), 1);

        slot.release();
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_full() {
        let gate = AdmissionGate::new(2);
        let cancel = CancellationToken::new();
        let _a = gate.acquire(1, WAIT, &cancel).await.unwrap();
        let _b = gate.acquire(1, WAIT, &cancel).await.unwrap();

        let err = gate
            .acquire(1, Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::AdmissionTimeout(d) if d == Duration::from_millis(50)));
        assert_eq!(gate.available(), 0);
    }

    #[tokio::test]
    async fn test_waiter_admitted_after_release() {
        let gate = AdmissionGate::new(1);
        let cancel = CancellationToken::new();
        let held = gate.acquire(1, WAIT, &cancel).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(1, WAIT, &cancel).await.map(|s| s.size()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_nothing_partial() {
        let gate = AdmissionGate::new(3);
        let cancel = CancellationToken::new();
        let _held = gate.acquire(2, WAIT, &cancel).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(2, WAIT, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(HerdError::Cancelled)));
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = AdmissionGate::new(1);
        gate.close();
        let err = gate
            .acquire(1, WAIT, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::ShuttingDown));
        assert!(gate.try_acquire(1).is_none());
    }
}
