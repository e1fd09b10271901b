use crate::builder::{PoolBuilder, PoolConfig};
use crate::capacity_gate::{CapacityGate, SlotPermit};
use crate::error::PoolError;
use crate::handle::{PoolHandle, WorkerInfo};
use crate::lifecycle::LifecycleControl;
use crate::notifier::{CallbackDispatcher, EventKind, PoolView};
use crate::outcome::{FailureKind, Outcome};
use crate::pending::PendingTracker;
use crate::task::{Task, TaskId};
use crate::worker::{self, Completion, SlotState, WorkerExit, WorkerSlot};

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_TASK_SEQ: AtomicU64 = AtomicU64::new(0);
}

/// What woke the controller while it was waiting for a free slot.
enum SlotWait {
  Permit(SlotPermit),
  Completion(Option<Completion>),
}

/// A pool of forked worker processes running one task each, at most `capacity`
/// at a time.
///
/// All operations take `&mut self`: the pool is driven by a single controller,
/// and every handler runs on that controller, one at a time. Wrap the pool in a
/// mutex to share it between tasks. Use [`ProcessPool::handle`] for read-only
/// status and stop requests from elsewhere.
pub struct ProcessPool {
  pool_name: Arc<String>,
  config: PoolConfig,
  gate: CapacityGate,
  slots: HashMap<u64, WorkerSlot>,
  workers: Arc<DashMap<u64, WorkerInfo>>,
  pending: PendingTracker,
  dispatcher: CallbackDispatcher,
  completions_tx: UnboundedSender<Completion>,
  completions_rx: UnboundedReceiver<Completion>,
  shutdown_token: CancellationToken,
  /// The timeout of the stop that had to kill workers, for their failure message.
  forced_after: Option<Duration>,
}

impl ProcessPool {
  pub fn builder(pool_name: impl Into<String>) -> PoolBuilder {
    PoolBuilder::new(pool_name)
  }

  /// Creates a pool with the given capacity and no handlers.
  pub fn new(pool_name: &str, capacity: usize) -> Result<Self, PoolError> {
    PoolBuilder::new(pool_name).capacity(capacity).build()
  }

  pub(crate) fn from_parts(pool_name: String, config: PoolConfig, dispatcher: CallbackDispatcher) -> Self {
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    info!(pool_name = %pool_name, capacity = config.capacity, "Process pool created.");
    Self {
      pool_name: Arc::new(pool_name),
      gate: CapacityGate::new(config.capacity),
      config,
      slots: HashMap::new(),
      workers: Arc::new(DashMap::new()),
      pending: PendingTracker::new(),
      dispatcher,
      completions_tx,
      completions_rx,
      shutdown_token: CancellationToken::new(),
      forced_after: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn capacity(&self) -> usize {
    self.gate.capacity()
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  /// Number of tasks admitted whose outcome has not been delivered yet.
  pub fn pending(&self) -> usize {
    self.pending.get()
  }

  /// Number of worker processes currently holding a slot.
  pub fn active_worker_count(&self) -> usize {
    self.slots.len()
  }

  pub fn is_stopping(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// A cloneable, thread-safe view of this pool that can also request a stop.
  pub fn handle(&self) -> PoolHandle {
    PoolHandle {
      pool_name: self.pool_name.clone(),
      capacity: self.gate.capacity(),
      pending: self.pending.clone(),
      workers: self.workers.clone(),
      shutdown_token: self.shutdown_token.clone(),
    }
  }

  /// Registers the assignment handler, replacing any previous one.
  pub fn on_assignment<F>(&mut self, handler: F)
  where
    F: FnMut(&PoolView<'_>, Option<&str>) -> anyhow::Result<()> + Send + 'static,
  {
    self.dispatcher.set_assignment(handler);
  }

  /// Registers the success handler, replacing any previous one.
  pub fn on_success<F>(&mut self, handler: F)
  where
    F: FnMut(&PoolView<'_>, Option<&str>, &[Value]) -> anyhow::Result<()> + Send + 'static,
  {
    self.dispatcher.set_success(handler);
  }

  /// Registers the failure handler, replacing any previous one.
  pub fn on_failure<F>(&mut self, handler: F)
  where
    F: FnMut(&PoolView<'_>, Option<&str>, &str) -> anyhow::Result<()> + Send + 'static,
  {
    self.dispatcher.set_failure(handler);
  }

  pub fn has_handler(&self, kind: EventKind) -> bool {
    self.dispatcher.has_handler(kind)
  }

  /// Runs `work` in a new worker process without an identifier.
  ///
  /// See [`ProcessPool::submit`].
  pub async fn assign<F, T, E>(&mut self, work: F) -> Result<(), PoolError>
  where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Serialize,
    E: Display,
  {
    self.submit(Task::new(work)).await
  }

  /// Runs `work` in a new worker process, tagging its events with `id`.
  pub async fn assign_with_id<F, T, E>(&mut self, id: impl Into<TaskId>, work: F) -> Result<(), PoolError>
  where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Serialize,
    E: Display,
  {
    self.submit(Task::new(work).with_id(id)).await
  }

  /// Admits `task`, waiting for a free slot if the pool is at capacity, fires
  /// the assignment handler and forks the worker. Returns once the worker is
  /// running; the outcome arrives later through the success or failure handler.
  ///
  /// While waiting for a slot, finished workers are reaped and their handlers
  /// run.
  ///
  /// Dropping the returned future before it resolves abandons the submission
  /// without leaking a pending count or a slot.
  ///
  /// # Errors
  /// `PoolShuttingDown` after [`ProcessPool::stop`] or a stop request, and
  /// `Callback` when a handler fails. Any handler error aborts the submission,
  /// including a success or failure handler of an earlier task reaped while
  /// this one waited: the task is not run and no outcome is reported for it.
  /// The earlier task's outcome has been fully settled by then, so the same
  /// task can simply be submitted again.
  pub async fn submit(&mut self, task: Task) -> Result<(), PoolError> {
    if self.is_stopping() {
      warn!(pool_name = %self.pool_name, task_id = ?task.id, "Submit: Attempted to submit task to a pool that is stopping.");
      return Err(PoolError::PoolShuttingDown);
    }

    self.reap_ready()?;

    let admission = self.pending.admit();
    let permit = self.acquire_slot().await?;

    let Task { id, work } = task;
    let seq = NEXT_TASK_SEQ.fetch_add(1, AtomicOrdering::Relaxed);

    // Counted as active while its handler runs: the slot is already reserved.
    let view = PoolView {
      name: &self.pool_name,
      capacity: self.gate.capacity(),
      pending: self.pending.get(),
      active: self.gate.active(),
    };
    if let Err(e) = self.dispatcher.dispatch_assignment(&view, id.as_deref()) {
      permit.release();
      drop(admission);
      warn!(pool_name = %self.pool_name, task_seq = seq, task_id = ?id, "Assignment handler failed; task will not run.");
      return Err(e);
    }

    trace!(pool_name = %self.pool_name, task_seq = seq, task_id = ?id, state = ?SlotState::Spawning, "Forking worker.");
    match worker::spawn_worker(seq, work) {
      Ok((pid, reader)) => {
        let started_at = Instant::now();
        let mut slot = WorkerSlot {
          seq,
          pid,
          task_id: id.clone(),
          state: SlotState::Spawning,
          started_at,
          forced: false,
          permit,
        };
        slot.advance(SlotState::Running);
        self.workers.insert(
          seq,
          WorkerInfo {
            pid: pid.as_raw(),
            task_seq: seq,
            task_id: id.clone(),
            started_at,
          },
        );
        self.slots.insert(seq, slot);
        admission.disarm();
        worker::watch_worker(
          &self.pool_name,
          seq,
          pid,
          reader,
          self.config.drain_grace(),
          self.completions_tx.clone(),
        );
        debug!(pool_name = %self.pool_name, task_seq = seq, task_id = ?id, pid = %pid, "Worker spawned.");
        Ok(())
      }
      Err(errno) => {
        error!(pool_name = %self.pool_name, task_seq = seq, task_id = ?id, "Failed to fork worker: {}", errno);
        permit.release();
        drop(admission);
        let outcome = Outcome::Failure {
          id,
          kind: FailureKind::Spawn,
          message: format!("failed to spawn worker: {}", errno),
        };
        self.dispatch(&outcome)
      }
    }
  }

  /// Waits until every admitted task has been reaped and its handler has run.
  pub async fn sync(&mut self) -> Result<(), PoolError> {
    debug!(pool_name = %self.pool_name, pending = self.pending(), "Sync: Draining pending tasks.");
    while self.pending() > 0 {
      let completion = self.completions_rx.recv().await.ok_or(PoolError::CompletionChannelClosed)?;
      self.reap(completion)?;
    }
    debug!(pool_name = %self.pool_name, "Sync: All pending tasks resolved.");
    Ok(())
  }

  /// Stops the pool: rejects new tasks and waits up to `timeout` for running
  /// workers to finish. Workers still running at the deadline are killed and
  /// reported as failures with a shutdown-timeout message.
  ///
  /// Returns `Ok(true)` if everything finished within the deadline.
  pub async fn stop(&mut self, timeout: Duration) -> Result<bool, PoolError> {
    let already_stopping = self.is_stopping();
    if already_stopping {
      info!(pool_name = %self.pool_name, "Stop already requested; draining remaining workers.");
    } else {
      info!(pool_name = %self.pool_name, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "Initiating pool stop.");
      self.shutdown_token.cancel();
    }
    if !self.gate.is_closed() {
      self.gate.close();
    }

    // A timeout too large to represent waits without a deadline.
    let deadline = tokio::time::Instant::now().checked_add(timeout);
    while self.pending() > 0 {
      let expired = async {
        match deadline {
          Some(deadline) => tokio::time::sleep_until(deadline).await,
          None => std::future::pending::<()>().await,
        }
      };
      let next = tokio::select! {
        completion = self.completions_rx.recv() => Some(completion),
        _ = expired => None,
      };
      match next {
        Some(completion) => self.reap(completion.ok_or(PoolError::CompletionChannelClosed)?)?,
        None => break,
      }
    }

    if self.pending() == 0 {
      info!(pool_name = %self.pool_name, "Pool stopped; all workers finished in time.");
      return Ok(true);
    }

    warn!(
      pool_name = %self.pool_name,
      remaining = self.slots.len(),
      "Stop deadline passed; killing remaining workers."
    );
    self.forced_after = Some(timeout);
    for slot in self.slots.values_mut() {
      if let Err(errno) = slot.kill() {
        // ESRCH: it exited on its own and its completion is on the way.
        debug!(pool_name = %self.pool_name, task_seq = slot.seq, pid = %slot.pid, "Kill failed: {}", errno);
      }
    }
    while self.pending() > 0 {
      let completion = self.completions_rx.recv().await.ok_or(PoolError::CompletionChannelClosed)?;
      self.reap(completion)?;
    }
    info!(pool_name = %self.pool_name, "Pool stopped after forcing remaining workers.");
    Ok(false)
  }

  /// One step of an external control loop: reaps finished workers, lets
  /// `control` record liveness, and reports whether the pool should keep
  /// running.
  pub fn poll<C: LifecycleControl + ?Sized>(&mut self, control: &C) -> Result<bool, PoolError> {
    self.reap_ready()?;
    if self.is_stopping() || control.should_stop() {
      return Ok(false);
    }
    control.heartbeat();
    Ok(true)
  }

  /// Drives the pool until `control` (or a [`PoolHandle`]) asks it to stop,
  /// reaping workers as they finish and heartbeating every poll interval, then
  /// performs [`ProcessPool::stop`] with `shutdown_timeout`.
  pub async fn run_until_stopped<C: LifecycleControl + ?Sized>(
    &mut self,
    control: &C,
    shutdown_timeout: Duration,
  ) -> Result<bool, PoolError> {
    info!(pool_name = %self.pool_name, "Running until stop is requested.");
    let poll_interval = self.config.poll_interval();
    while self.poll(control)? {
      let next = tokio::select! {
        completion = self.completions_rx.recv() => Some(completion),
        _ = tokio::time::sleep(poll_interval) => None,
        _ = self.shutdown_token.cancelled() => None,
      };
      if let Some(completion) = next {
        self.reap(completion.ok_or(PoolError::CompletionChannelClosed)?)?;
      }
    }
    info!(pool_name = %self.pool_name, "Stop requested by lifecycle control.");
    self.stop(shutdown_timeout).await
  }

  async fn acquire_slot(&mut self) -> Result<SlotPermit, PoolError> {
    loop {
      if let Some(permit) = self.gate.try_acquire()? {
        return Ok(permit);
      }
      debug!(pool_name = %self.pool_name, active = self.slots.len(), "At capacity; waiting for a worker to finish.");

      let next = tokio::select! {
        biased;
        permit = self.gate.acquire() => SlotWait::Permit(permit?),
        completion = self.completions_rx.recv() => SlotWait::Completion(completion),
      };
      match next {
        SlotWait::Permit(permit) => return Ok(permit),
        SlotWait::Completion(Some(completion)) => self.reap(completion)?,
        SlotWait::Completion(None) => return Err(PoolError::CompletionChannelClosed),
      }
    }
  }

  fn reap_ready(&mut self) -> Result<(), PoolError> {
    loop {
      match self.completions_rx.try_recv() {
        Ok(completion) => self.reap(completion)?,
        Err(TryRecvError::Empty) => return Ok(()),
        Err(TryRecvError::Disconnected) => return Err(PoolError::CompletionChannelClosed),
      }
    }
  }

  /// Consumes one completion: frees the slot, settles the pending count, then
  /// runs the success or failure handler.
  fn reap(&mut self, completion: Completion) -> Result<(), PoolError> {
    let Some(mut slot) = self.slots.remove(&completion.seq) else {
      error!(pool_name = %self.pool_name, task_seq = completion.seq, pid = %completion.pid, "Completion for unknown worker slot.");
      return Ok(());
    };
    slot.advance(SlotState::Completed);
    self.workers.remove(&slot.seq);

    let outcome = match completion.report {
      Some(report) => report.into_outcome(slot.task_id.take()),
      None if slot.forced => Outcome::Failure {
        id: slot.task_id.take(),
        kind: FailureKind::ShutdownTimeout,
        message: format!(
          "worker terminated after shutdown timeout of {}ms",
          self.forced_after.unwrap_or_default().as_millis()
        ),
      },
      None => {
        let message = match &completion.exit {
          WorkerExit::Exited(0) => "worker exited without reporting an outcome (exit code 0)".to_string(),
          exit => format!("worker terminated abnormally: {}", exit),
        };
        warn!(pool_name = %self.pool_name, task_seq = slot.seq, pid = %slot.pid, exit = %completion.exit, "Worker crashed.");
        Outcome::Failure {
          id: slot.task_id.take(),
          kind: FailureKind::Crash,
          message,
        }
      }
    };

    let elapsed = slot.started_at.elapsed();
    slot.advance(SlotState::Reaped);
    let WorkerSlot { permit, .. } = slot;
    permit.release();
    self.pending.decrement();
    debug!(
      pool_name = %self.pool_name,
      task_seq = completion.seq,
      task_id = ?outcome.id(),
      success = outcome.is_success(),
      failure_kind = ?outcome.failure_kind(),
      elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
      "Worker reaped."
    );

    self.dispatch(&outcome)
  }

  fn dispatch(&mut self, outcome: &Outcome) -> Result<(), PoolError> {
    let view = PoolView {
      name: &self.pool_name,
      capacity: self.gate.capacity(),
      pending: self.pending.get(),
      active: self.slots.len(),
    };
    self.dispatcher.dispatch_outcome(&view, outcome)
  }
}

impl Drop for ProcessPool {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      self.shutdown_token.cancel();
    }
    if self.slots.is_empty() {
      trace!(pool_name = %self.pool_name, "Drop: No live workers.");
      return;
    }
    warn!(
      pool_name = %self.pool_name,
      remaining = self.slots.len(),
      "ProcessPool dropped with live workers; killing them. Their outcomes will not be reported."
    );
    for slot in self.slots.values_mut() {
      let _ = slot.kill();
    }
  }
}
