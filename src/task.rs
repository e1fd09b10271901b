use std::fmt;
use std::fmt::Display;

use serde::Serialize;
use serde_json::Value;

/// An opaque, caller-supplied identifier for a task.
pub type TaskId = String;

/// What a task produces once it has run inside its worker process: zero or more
/// result values, or a failure message.
pub type TaskResult = Result<Vec<Value>, String>;

/// The type-erased unit of work a worker process executes.
pub type Work = Box<dyn FnOnce() -> TaskResult + Send + 'static>;

/// A unit of work submitted to a [`ProcessPool`](crate::ProcessPool).
///
/// The callable runs in a forked child process. It sees a copy of the
/// controller's memory at fork time, so anything it mutates stays in the child;
/// only its return value or failure crosses back.
pub struct Task {
  pub(crate) id: Option<TaskId>,
  pub(crate) work: Work,
}

impl Task {
  /// Wraps a fallible closure. The `Ok` value is serialized with serde and
  /// spread into result values (see [`into_values`]); the `Err` value becomes
  /// the failure message.
  pub fn new<F, T, E>(work: F) -> Self
  where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Serialize,
    E: Display,
  {
    Self {
      id: None,
      work: Box::new(move || match work() {
        Ok(output) => into_values(&output),
        Err(e) => Err(e.to_string()),
      }),
    }
  }

  /// Builds a task from an already type-erased callable.
  pub fn from_work(work: Work) -> Self {
    Self { id: None, work }
  }

  pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
    self.id = Some(id.into());
    self
  }

  pub fn id(&self) -> Option<&str> {
    self.id.as_deref()
  }
}

impl fmt::Debug for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task").field("id", &self.id).finish_non_exhaustive()
  }
}

/// Converts a task's return value into the list of values delivered to the
/// success handler.
///
/// `()` and other values serializing to `null` yield no values, tuples and
/// sequences yield their elements in order, anything else yields one value.
pub fn into_values<T: Serialize + ?Sized>(output: &T) -> TaskResult {
  match serde_json::to_value(output) {
    Ok(Value::Null) => Ok(Vec::new()),
    Ok(Value::Array(values)) => Ok(values),
    Ok(value) => Ok(vec![value]),
    Err(e) => Err(format!("failed to serialize task result: {}", e)),
  }
}
