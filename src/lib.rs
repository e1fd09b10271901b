//! A Tokio-driven pool of forked worker processes with a capacity limit,
//! outcome callbacks, a sync barrier and cooperative shutdown.
//!
//! Each task runs in its own forked child process, so a task that crashes or is
//! killed cannot take the controller down with it. Unix only.

mod builder;
mod capacity_gate;
mod codec;
mod error;
mod handle;
mod lifecycle;
mod manager;
mod notifier;
mod outcome;
mod pending;
mod task;
mod worker;

pub use builder::{PoolBuilder, PoolConfig};
pub use error::{LifecycleError, PoolError};
pub use handle::{PoolHandle, WorkerInfo};
pub use lifecycle::{
  request_stop, status, ControlFiles, FileControl, LifecycleControl, ServiceStatus, StopSignal,
  DEFAULT_HEARTBEAT_INTERVAL,
};
pub use manager::ProcessPool;
pub use notifier::{AssignmentHandler, EventKind, FailureHandler, PoolView, SuccessHandler};
pub use task::{into_values, Task, TaskId, TaskResult, Work};
