//! Admission control for concurrent runs.
//!
//! A semaphore caps how many runs are driven at once. Under the `queue`
//! policy a new run waits for a permit; under `reject` it is refused on the
//! spot. Permits are released when dropped.

use hone_core::AdmissionPolicy;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission pool exhausted ({0} runs active)")]
    AtCapacity(usize),
    #[error("cancelled while waiting for admission")]
    Cancelled,
    #[error("admission gate closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    policy: AdmissionPolicy,
}

impl AdmissionGate {
    pub fn new(max_concurrent: usize, policy: AdmissionPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            policy,
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Runs currently holding a permit.
    pub fn active_count(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Take a permit without waiting.
    pub fn try_admit(&self) -> Result<OwnedSemaphorePermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => Err(AdmissionError::AtCapacity(self.active_count())),
            Err(TryAcquireError::Closed) => Err(AdmissionError::Closed),
        }
    }

    /// Wait for a permit. Returns early if `cancel` fires.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        if self.semaphore.available_permits() == 0 {
            debug!(max_concurrent = self.max_concurrent, "run queued for admission");
        }
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| AdmissionError::Closed)
            }
            () = cancel.cancelled() => Err(AdmissionError::Cancelled),
        }
    }

    /// Stop handing out permits. Waiters fail with `Closed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
