use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts tasks that have been admitted but whose outcome has not been
/// delivered yet.
///
/// Only the controller mutates it; clones are shared with [`PoolHandle`](crate::PoolHandle)
/// for point-in-time reads from other threads.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingTracker {
  count: Arc<AtomicUsize>,
}

impl PendingTracker {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn get(&self) -> usize {
    self.count.load(Ordering::Acquire)
  }

  pub(crate) fn increment(&self) -> usize {
    self.count.fetch_add(1, Ordering::AcqRel) + 1
  }

  /// Decrements the count, saturating at zero. A decrement below zero means a
  /// task was resolved twice.
  pub(crate) fn decrement(&self) -> usize {
    match self
      .count
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
    {
      Ok(previous) => previous - 1,
      Err(_) => {
        tracing::error!("Pending tracker decremented below zero; a task outcome was delivered twice.");
        0
      }
    }
  }

  /// Counts a task as pending until the returned guard is disarmed. Dropping
  /// an armed guard undoes the increment, so an admission abandoned at an
  /// `.await` leaves the count unchanged.
  pub(crate) fn admit(&self) -> PendingGuard {
    self.increment();
    PendingGuard {
      tracker: self.clone(),
      armed: true,
    }
  }
}

/// An admission in progress. See [`PendingTracker::admit`].
#[derive(Debug)]
pub(crate) struct PendingGuard {
  tracker: PendingTracker,
  armed: bool,
}

impl PendingGuard {
  /// The task now has a worker; its reap settles the count.
  pub(crate) fn disarm(mut self) {
    self.armed = false;
  }
}

impl Drop for PendingGuard {
  fn drop(&mut self) {
    if self.armed {
      self.tracker.decrement();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counts_up_and_down() {
    let tracker = PendingTracker::new();
    assert_eq!(tracker.increment(), 1);
    assert_eq!(tracker.increment(), 2);
    assert_eq!(tracker.decrement(), 1);

    let view = tracker.clone();
    assert_eq!(view.get(), 1);
    tracker.decrement();
    assert_eq!(view.get(), 0);
  }

  #[test]
  fn dropped_admission_is_undone() {
    let tracker = PendingTracker::new();
    let abandoned = tracker.admit();
    assert_eq!(tracker.get(), 1);
    drop(abandoned);
    assert_eq!(tracker.get(), 0);

    tracker.admit().disarm();
    assert_eq!(tracker.get(), 1);
  }

  #[test]
  fn decrement_saturates_at_zero() {
    let tracker = PendingTracker::new();
    assert_eq!(tracker.decrement(), 0);
    assert_eq!(tracker.get(), 0);
  }
}
