use crate::error::PoolError;

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Bounds the number of simultaneously live worker slots.
///
/// Backed by a Tokio semaphore, so waiters are served in FIFO order and a
/// steady stream of acquisitions cannot starve an earlier waiter.
#[derive(Debug)]
pub(crate) struct CapacityGate {
  semaphore: Arc<Semaphore>,
  capacity: usize,
}

/// One reserved slot. Dropping it (or calling [`SlotPermit::release`]) frees the
/// slot and wakes at most one waiter.
#[derive(Debug)]
pub(crate) struct SlotPermit {
  _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
  pub(crate) fn release(self) {}
}

impl CapacityGate {
  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      semaphore: Arc::new(Semaphore::new(capacity)),
      capacity,
    }
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  pub(crate) fn available(&self) -> usize {
    self.semaphore.available_permits()
  }

  pub(crate) fn active(&self) -> usize {
    self.capacity.saturating_sub(self.available())
  }

  /// Waits until a slot is free and reserves it.
  pub(crate) async fn acquire(&self) -> Result<SlotPermit, PoolError> {
    let permit = self
      .semaphore
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| PoolError::GateClosed)?;
    Ok(SlotPermit { _permit: permit })
  }

  /// Reserves a slot if one is free right now.
  pub(crate) fn try_acquire(&self) -> Result<Option<SlotPermit>, PoolError> {
    match self.semaphore.clone().try_acquire_owned() {
      Ok(permit) => Ok(Some(SlotPermit { _permit: permit })),
      Err(TryAcquireError::NoPermits) => Ok(None),
      Err(TryAcquireError::Closed) => Err(PoolError::GateClosed),
    }
  }

  /// Fails all current and future acquisitions. Permits already handed out stay
  /// valid until released.
  pub(crate) fn close(&self) {
    self.semaphore.close();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.semaphore.is_closed()
  }
}
