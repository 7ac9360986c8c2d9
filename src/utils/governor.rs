//! # Concurrency Governor
//!
//! Counting admission gate bounding how many handler chains run at once,
//! independent of how many sessions or datagrams are in flight.
//!
//! Acquisition waits when the gate is exhausted; nothing is rejected. The
//! returned [`GovernorPermit`] releases its unit when dropped, whether the chain
//! finished, failed or panicked.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone)]
pub struct Governor {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// One admitted handler execution
#[derive(Debug)]
pub struct GovernorPermit {
    _permit: OwnedSemaphorePermit,
}

impl Governor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free unit
    pub async fn acquire(&self) -> Result<GovernorPermit> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::Custom("governor closed".to_string()))?;
        Ok(GovernorPermit { _permit: permit })
    }

    /// Take a unit only if one is free right now
    pub fn try_acquire(&self) -> Option<GovernorPermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| GovernorPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Units currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wake all waiters with an error; used once the server has stopped
    pub fn close(&self) {
        self.permits.close();
    }
}
