use crate::lifecycle::LifecycleControl;
use crate::pending::PendingTracker;
use crate::task::TaskId;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// A live worker process as seen from a [`PoolHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
  pub pid: i32,
  pub task_seq: u64,
  pub task_id: Option<TaskId>,
  pub started_at: Instant,
}

/// A cloneable, `Send + Sync` view of a [`ProcessPool`](crate::ProcessPool).
///
/// Reads are point-in-time snapshots. The only thing a handle can change is to
/// request a stop, which the pool acts on at its next `poll`,
/// `run_until_stopped` or `stop` call, and which makes further submissions
/// fail with `PoolShuttingDown`.
#[derive(Clone)]
pub struct PoolHandle {
  pub(crate) pool_name: Arc<String>,
  pub(crate) capacity: usize,
  pub(crate) pending: PendingTracker,
  pub(crate) workers: Arc<DashMap<u64, WorkerInfo>>,
  pub(crate) shutdown_token: CancellationToken,
}

impl PoolHandle {
  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn pending(&self) -> usize {
    self.pending.get()
  }

  pub fn active_worker_count(&self) -> usize {
    self.workers.len()
  }

  /// The live workers, oldest first.
  pub fn active_workers(&self) -> Vec<WorkerInfo> {
    let mut workers: Vec<WorkerInfo> = self.workers.iter().map(|entry| entry.value().clone()).collect();
    workers.sort_by_key(|info| info.task_seq);
    workers
  }

  /// Asks the pool to stop accepting tasks and shut down.
  pub fn request_stop(&self) {
    tracing::debug!(pool_name = %self.pool_name, "PoolHandle: Stop requested.");
    self.shutdown_token.cancel();
  }

  pub fn is_stop_requested(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }
}

impl LifecycleControl for PoolHandle {
  fn should_stop(&self) -> bool {
    self.is_stop_requested()
  }
}

impl fmt::Debug for PoolHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolHandle")
      .field("pool_name", &self.pool_name)
      .field("capacity", &self.capacity)
      .field("pending", &self.pending())
      .field("active_workers", &self.active_worker_count())
      .field("stop_requested", &self.is_stop_requested())
      .finish()
  }
}
