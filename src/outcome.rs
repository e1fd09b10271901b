use crate::task::{TaskId, TaskResult};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a task resolved as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FailureKind {
  /// The task's callable returned an error.
  Task,
  /// The task's callable panicked inside the worker.
  Panic,
  /// The worker process terminated without reporting an outcome.
  Crash,
  /// The worker was still running when a stop deadline passed and was killed.
  ShutdownTimeout,
  /// The worker process could not be created.
  Spawn,
}

/// The resolved result of one task, as seen by the controller.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
  Success {
    id: Option<TaskId>,
    values: Vec<Value>,
  },
  Failure {
    id: Option<TaskId>,
    kind: FailureKind,
    message: String,
  },
}

impl Outcome {
  pub(crate) fn id(&self) -> Option<&str> {
    match self {
      Outcome::Success { id, .. } | Outcome::Failure { id, .. } => id.as_deref(),
    }
  }

  pub(crate) fn is_success(&self) -> bool {
    matches!(self, Outcome::Success { .. })
  }

  pub(crate) fn failure_kind(&self) -> Option<FailureKind> {
    match self {
      Outcome::Success { .. } => None,
      Outcome::Failure { kind, .. } => Some(*kind),
    }
  }
}

/// The envelope a worker writes to its result pipe. Exactly one is written per
/// worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerReport {
  Success {
    task: u64,
    values: Vec<Value>,
  },
  Failure {
    task: u64,
    message: String,
    #[serde(default)]
    panicked: bool,
  },
}

impl WorkerReport {
  pub(crate) fn from_result(task: u64, result: TaskResult) -> Self {
    match result {
      Ok(values) => WorkerReport::Success { task, values },
      Err(message) => WorkerReport::Failure {
        task,
        message,
        panicked: false,
      },
    }
  }

  pub(crate) fn panicked(task: u64, message: String) -> Self {
    WorkerReport::Failure {
      task,
      message,
      panicked: true,
    }
  }

  pub(crate) fn task(&self) -> u64 {
    match self {
      WorkerReport::Success { task, .. } | WorkerReport::Failure { task, .. } => *task,
    }
  }

  pub(crate) fn into_outcome(self, id: Option<TaskId>) -> Outcome {
    match self {
      WorkerReport::Success { values, .. } => Outcome::Success { id, values },
      WorkerReport::Failure {
        message, panicked, ..
      } => Outcome::Failure {
        id,
        kind: if panicked { FailureKind::Panic } else { FailureKind::Task },
        message,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn report_wire_format_is_tagged() {
    let report = WorkerReport::from_result(7, Ok(vec![json!(1), json!("a")]));
    let encoded = serde_json::to_value(&report).unwrap();
    assert_eq!(encoded, json!({"type": "success", "task": 7, "values": [1, "a"]}));

    let failure: WorkerReport =
      serde_json::from_value(json!({"type": "failure", "task": 3, "message": "boom"})).unwrap();
    assert_eq!(failure.task(), 3);
    assert_eq!(
      failure.into_outcome(Some("t3".to_string())),
      Outcome::Failure {
        id: Some("t3".to_string()),
        kind: FailureKind::Task,
        message: "boom".to_string(),
      }
    );
  }

  #[test]
  fn panicked_report_maps_to_panic_kind() {
    let outcome = WorkerReport::panicked(1, "oops".to_string()).into_outcome(None);
    assert!(!outcome.is_success());
    assert_eq!(outcome.id(), None);
    assert_eq!(outcome.failure_kind(), Some(FailureKind::Panic));
  }
}
