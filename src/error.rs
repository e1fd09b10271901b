use crate::notifier::EventKind;

use std::io;

use thiserror::Error;

/// Errors that can occur within the `procpool` pool manager.
///
/// Task-level problems (a failing or panicking task, a crashed worker, a worker
/// killed by shutdown) are never reported here. They are delivered through the
/// failure handler instead.
#[derive(Error, Debug)]
pub enum PoolError {
  #[error("Invalid pool name {0:?}: must be non-empty and free of path separators")]
  InvalidName(String),

  #[error("Invalid pool capacity {0}: must be at least 1")]
  InvalidCapacity(usize),

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("{event} handler failed: {source}")]
  Callback {
    event: EventKind,
    #[source]
    source: anyhow::Error,
  },

  #[error("Pool's capacity gate was closed unexpectedly")]
  GateClosed,

  #[error("Pool's worker completion channel was closed unexpectedly")]
  CompletionChannelClosed,
}

/// Errors raised by the file-based lifecycle adapter.
#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error("Pool is already running under pid {pid}")]
  AlreadyRunning { pid: i32 },

  #[error("Lifecycle control file error: {0}")]
  Io(#[from] io::Error),
}
