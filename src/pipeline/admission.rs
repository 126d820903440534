// Caps how many workers run at once.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A slot for one running worker. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    // None = unlimited
    semaphore: Option<Arc<Semaphore>>,
    wait_timeout: Duration,
}

impl AdmissionGate {
    /// `max_concurrent == 0` disables the limit.
    pub fn new(max_concurrent: usize, wait_timeout: Duration) -> Self {
        Self {
            semaphore: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
            wait_timeout,
        }
    }

    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Waits up to the configured timeout for a free slot. `None` means the
    /// server stayed saturated for the whole wait.
    pub async fn admit(&self) -> Option<WorkerPermit> {
        let Some(semaphore) = &self.semaphore else {
            return Some(WorkerPermit { _permit: None });
        };

        if self.available() == Some(0) {
            debug!("All worker slots busy, waiting up to {:?}", self.wait_timeout);
        }

        match tokio::time::timeout(self.wait_timeout, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(WorkerPermit {
                _permit: Some(permit),
            }),
            // Closed semaphores are never produced here, treat it like saturation.
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_gate_always_admits() {
        let gate = AdmissionGate::new(0, Duration::from_millis(10));
        assert_eq!(gate.available(), None);
        let a = gate.admit().await;
        let b = gate.admit().await;
        assert!(a.is_some() && b.is_some());
    }

    #[tokio::test]
    async fn test_saturated_gate_times_out() {
        let gate = AdmissionGate::new(1, Duration::from_millis(50));
        let held = gate.admit().await.unwrap();
        assert_eq!(gate.available(), Some(0));
        assert!(gate.admit().await.is_none());

        drop(held);
        assert_eq!(gate.available(), Some(1));
        assert!(gate.admit().await.is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let gate = AdmissionGate::new(1, Duration::from_secs(5));
        let held = gate.admit().await.unwrap();

        let mut waiter = tokio_test::task::spawn(gate.admit());
        tokio_test::assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let permit = tokio_test::assert_ready!(waiter.poll());
        assert!(permit.is_some());
    }
}
