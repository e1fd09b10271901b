//! Worker processes: forking, the child-side entry point, and the controller-side
//! watcher that turns a finished process into a [`Completion`].
//!
//! A worker is a forked copy of the controller. The child runs exactly one task,
//! writes one [`WorkerReport`] frame to its result pipe and calls `_exit`. On the
//! controller side one Tokio task reads the pipe while a blocking thread waits on
//! the pid; whichever finishes first, the watcher collects both and sends a
//! `Completion` to the pool.

use crate::codec::JsonCodec;
use crate::capacity_gate::SlotPermit;
use crate::outcome::WorkerReport;
use crate::task::{TaskId, Work};

use std::any::Any;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use futures::StreamExt;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tokio::net::unix::pipe;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, info_span, trace, warn, Instrument};

/// Exit code of a worker that ran its task but could not deliver the report.
const REPORT_WRITE_FAILED: i32 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
  Spawning,
  Running,
  Completed,
  Reaped,
}

/// The controller's record of one live worker process.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
  pub(crate) seq: u64,
  pub(crate) pid: Pid,
  pub(crate) task_id: Option<TaskId>,
  pub(crate) state: SlotState,
  pub(crate) started_at: Instant,
  /// Set when the pool killed this worker because a stop deadline passed.
  pub(crate) forced: bool,
  pub(crate) permit: SlotPermit,
}

impl WorkerSlot {
  pub(crate) fn advance(&mut self, next: SlotState) {
    trace!(task_seq = self.seq, pid = %self.pid, from = ?self.state, to = ?next, "Worker slot transition.");
    self.state = next;
  }

  pub(crate) fn kill(&mut self) -> nix::Result<()> {
    self.forced = true;
    signal::kill(self.pid, Signal::SIGKILL)
  }
}

/// How a worker process ended, as reported by `waitpid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerExit {
  Exited(i32),
  Signaled(Signal),
  Unknown(String),
}

impl fmt::Display for WorkerExit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WorkerExit::Exited(code) => write!(f, "exit code {}", code),
      WorkerExit::Signaled(sig) => write!(f, "killed by signal {}", sig.as_str()),
      WorkerExit::Unknown(reason) => write!(f, "unknown exit status ({})", reason),
    }
  }
}

/// What a watcher sends back once its worker is gone.
#[derive(Debug)]
pub(crate) struct Completion {
  pub(crate) seq: u64,
  pub(crate) pid: Pid,
  pub(crate) report: Option<WorkerReport>,
  pub(crate) exit: WorkerExit,
}

/// Forks a worker process that runs `work`. Returns the child's pid and the
/// read end of its result pipe.
///
/// Must be called on the controller's thread. The child never returns from
/// this function.
pub(crate) fn spawn_worker(seq: u64, work: Work) -> nix::Result<(Pid, OwnedFd)> {
  let (reader, writer) = unistd::pipe()?;

  // SAFETY: the child only runs the task, encodes its report and `_exit`s. It
  // never touches the async runtime or the tracing subscriber.
  match unsafe { unistd::fork()? } {
    ForkResult::Parent { child } => {
      drop(writer);
      Ok((child, reader))
    }
    ForkResult::Child => {
      drop(reader);
      run_in_child(seq, work, writer)
    }
  }
}

fn run_in_child(seq: u64, work: Work, writer: OwnedFd) -> ! {
  let report = match panic::catch_unwind(AssertUnwindSafe(work)) {
    Ok(result) => WorkerReport::from_result(seq, result),
    Err(payload) => WorkerReport::panicked(seq, panic_message(payload.as_ref())),
  };

  let code = match write_report(writer, report) {
    Ok(()) => 0,
    Err(_) => REPORT_WRITE_FAILED,
  };
  // SAFETY: `_exit` skips atexit handlers and destructors, which belong to the
  // controller's copy of the process state.
  unsafe { libc::_exit(code) }
}

fn write_report(writer: OwnedFd, report: WorkerReport) -> std::io::Result<()> {
  let frame = encode_report(report)?;
  let mut file = File::from(writer);
  file.write_all(&frame)?;
  file.flush()
}

/// Encodes `report` as one frame. A report that cannot be framed, for example
/// because it exceeds the frame size limit, is replaced by a failure naming
/// the encoding error.
fn encode_report(report: WorkerReport) -> std::io::Result<BytesMut> {
  let task = report.task();
  let mut codec = JsonCodec::<WorkerReport>::new();
  let mut frame = BytesMut::new();
  if let Err(e) = codec.encode(report, &mut frame) {
    frame.clear();
    let failure = WorkerReport::from_result(task, Err(format!("failed to encode task result: {}", e)));
    codec.encode(failure, &mut frame)?;
  }
  Ok(frame)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    format!("task panicked: {}", message)
  } else if let Some(message) = payload.downcast_ref::<String>() {
    format!("task panicked: {}", message)
  } else {
    "task panicked".to_string()
  }
}

/// Starts the watcher for a freshly forked worker. It reports exactly one
/// [`Completion`] on `completions`.
pub(crate) fn watch_worker(
  pool_name: &str,
  seq: u64,
  pid: Pid,
  reader: OwnedFd,
  drain_grace: Duration,
  completions: UnboundedSender<Completion>,
) {
  let span = info_span!("worker_watch", pool_name = %pool_name, task_seq = seq, pid = %pid);
  tokio::spawn(
    async move {
      let (report, exit) = collect(seq, pid, reader, drain_grace).await;
      debug!(exit = %exit, reported = report.is_some(), "Worker finished.");
      if completions.send(Completion { seq, pid, report, exit }).is_err() {
        warn!("Pool was dropped before the worker completion could be delivered.");
      }
    }
    .instrument(span),
  );
}

async fn collect(seq: u64, pid: Pid, reader: OwnedFd, drain_grace: Duration) -> (Option<WorkerReport>, WorkerExit) {
  let mut exit = tokio::task::spawn_blocking(move || waitpid(pid, None));

  let receiver = match pipe::Receiver::from_owned_fd(reader) {
    Ok(receiver) => receiver,
    Err(e) => {
      warn!("Could not attach to worker result pipe: {}", e);
      return (None, wait_result(exit.await));
    }
  };
  let mut frames = FramedRead::new(receiver, JsonCodec::<WorkerReport>::new());
  let read = async move { frames.next().await };
  tokio::pin!(read);

  let (frame, status) = tokio::select! {
    frame = &mut read => (frame, (&mut exit).await),
    status = &mut exit => {
      // The child is gone, so anything it wrote is already buffered. Other
      // processes forked in the meantime may still hold the write end, so EOF
      // cannot be relied on.
      let frame = tokio::time::timeout(drain_grace, &mut read).await.ok().flatten();
      (frame, status)
    }
  };

  let report = match frame {
    Some(Ok(report)) if report.task() == seq => Some(report),
    Some(Ok(report)) => {
      warn!(reported_seq = report.task(), "Worker reported an outcome for a different task; ignoring it.");
      None
    }
    Some(Err(e)) => {
      warn!("Malformed worker report: {}", e);
      None
    }
    None => None,
  };
  (report, wait_result(status))
}

fn wait_result(status: Result<nix::Result<WaitStatus>, tokio::task::JoinError>) -> WorkerExit {
  match status {
    Ok(Ok(WaitStatus::Exited(_, code))) => WorkerExit::Exited(code),
    Ok(Ok(WaitStatus::Signaled(_, sig, _))) => WorkerExit::Signaled(sig),
    Ok(Ok(other)) => WorkerExit::Unknown(format!("{:?}", other)),
    Ok(Err(errno)) => WorkerExit::Unknown(errno.desc().to_string()),
    Err(join_error) => WorkerExit::Unknown(join_error.to_string()),
  }
}
