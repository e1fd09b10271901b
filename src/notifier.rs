use crate::error::PoolError;
use crate::outcome::Outcome;

use std::fmt;

use serde_json::Value;
use tracing::{debug, trace};

/// The three events a pool reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Assignment,
  Success,
  Failure,
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      EventKind::Assignment => "assignment",
      EventKind::Success => "success",
      EventKind::Failure => "failure",
    };
    f.write_str(name)
  }
}

/// Snapshot of the pool handed to every handler, taken just before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolView<'a> {
  pub name: &'a str,
  pub capacity: usize,
  pub pending: usize,
  pub active: usize,
}

pub type AssignmentHandler = Box<dyn FnMut(&PoolView<'_>, Option<&str>) -> anyhow::Result<()> + Send + 'static>;
pub type SuccessHandler =
  Box<dyn FnMut(&PoolView<'_>, Option<&str>, &[Value]) -> anyhow::Result<()> + Send + 'static>;
pub type FailureHandler = Box<dyn FnMut(&PoolView<'_>, Option<&str>, &str) -> anyhow::Result<()> + Send + 'static>;

/// Holds at most one handler per [`EventKind`] and invokes them on the
/// controller.
///
/// Registering a handler for a kind that already has one replaces it. A handler
/// error is returned to the caller as [`PoolError::Callback`]; callers update
/// their own bookkeeping before dispatching.
#[derive(Default)]
pub(crate) struct CallbackDispatcher {
  on_assignment: Option<AssignmentHandler>,
  on_success: Option<SuccessHandler>,
  on_failure: Option<FailureHandler>,
}

impl fmt::Debug for CallbackDispatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallbackDispatcher")
      .field("on_assignment", &self.on_assignment.is_some())
      .field("on_success", &self.on_success.is_some())
      .field("on_failure", &self.on_failure.is_some())
      .finish()
  }
}

impl CallbackDispatcher {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn set_assignment<F>(&mut self, handler: F)
  where
    F: FnMut(&PoolView<'_>, Option<&str>) -> anyhow::Result<()> + Send + 'static,
  {
    let handler: AssignmentHandler = Box::new(handler);
    if self.on_assignment.replace(handler).is_some() {
      debug!(event = %EventKind::Assignment, "Replacing previously registered handler.");
    }
  }

  pub(crate) fn set_success<F>(&mut self, handler: F)
  where
    F: FnMut(&PoolView<'_>, Option<&str>, &[Value]) -> anyhow::Result<()> + Send + 'static,
  {
    let handler: SuccessHandler = Box::new(handler);
    if self.on_success.replace(handler).is_some() {
      debug!(event = %EventKind::Success, "Replacing previously registered handler.");
    }
  }

  pub(crate) fn set_failure<F>(&mut self, handler: F)
  where
    F: FnMut(&PoolView<'_>, Option<&str>, &str) -> anyhow::Result<()> + Send + 'static,
  {
    let handler: FailureHandler = Box::new(handler);
    if self.on_failure.replace(handler).is_some() {
      debug!(event = %EventKind::Failure, "Replacing previously registered handler.");
    }
  }

  pub(crate) fn has_handler(&self, kind: EventKind) -> bool {
    match kind {
      EventKind::Assignment => self.on_assignment.is_some(),
      EventKind::Success => self.on_success.is_some(),
      EventKind::Failure => self.on_failure.is_some(),
    }
  }

  pub(crate) fn dispatch_assignment(&mut self, view: &PoolView<'_>, id: Option<&str>) -> Result<(), PoolError> {
    match self.on_assignment.as_mut() {
      Some(handler) => handler(view, id).map_err(|source| PoolError::Callback {
        event: EventKind::Assignment,
        source,
      }),
      None => {
        trace!(pool_name = %view.name, task_id = ?id, "No assignment handler registered.");
        Ok(())
      }
    }
  }

  pub(crate) fn dispatch_outcome(&mut self, view: &PoolView<'_>, outcome: &Outcome) -> Result<(), PoolError> {
    match outcome {
      Outcome::Success { id, values } => match self.on_success.as_mut() {
        Some(handler) => handler(view, id.as_deref(), values).map_err(|source| PoolError::Callback {
          event: EventKind::Success,
          source,
        }),
        None => {
          trace!(pool_name = %view.name, task_id = ?id, "No success handler registered, dropping outcome.");
          Ok(())
        }
      },
      Outcome::Failure { id, message, .. } => match self.on_failure.as_mut() {
        Some(handler) => handler(view, id.as_deref(), message).map_err(|source| PoolError::Callback {
          event: EventKind::Failure,
          source,
        }),
        None => {
          trace!(pool_name = %view.name, task_id = ?id, "No failure handler registered, dropping outcome.");
          Ok(())
        }
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::outcome::FailureKind;
  use serde_json::json;
  use std::sync::Arc;

  fn view() -> PoolView<'static> {
    PoolView {
      name: "notifier_test",
      capacity: 2,
      pending: 1,
      active: 1,
    }
  }

  #[test]
  fn last_registration_wins() {
    let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut dispatcher = CallbackDispatcher::new();

    let first = calls.clone();
    dispatcher.set_assignment(move |_, id| {
      first.lock().push(format!("first:{:?}", id));
      Ok(())
    });
    let second = calls.clone();
    dispatcher.set_assignment(move |_, id| {
      second.lock().push(format!("second:{:?}", id));
      Ok(())
    });

    dispatcher.dispatch_assignment(&view(), Some("a")).unwrap();
    assert_eq!(*calls.lock(), vec!["second:Some(\"a\")".to_string()]);
  }

  #[test]
  fn outcomes_route_to_matching_handler() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut dispatcher = CallbackDispatcher::new();

    let on_success = seen.clone();
    dispatcher.set_success(move |_, id, values| {
      on_success.lock().push((EventKind::Success, id.map(str::to_string), values.to_vec()));
      Ok(())
    });
    let on_failure = seen.clone();
    dispatcher.set_failure(move |_, id, message| {
      on_failure.lock().push((EventKind::Failure, id.map(str::to_string), vec![json!(message)]));
      Ok(())
    });

    dispatcher
      .dispatch_outcome(
        &view(),
        &Outcome::Success {
          id: Some("ok".to_string()),
          values: vec![json!(1), json!("a")],
        },
      )
      .unwrap();
    dispatcher
      .dispatch_outcome(
        &view(),
        &Outcome::Failure {
          id: None,
          kind: FailureKind::Task,
          message: "boom".to_string(),
        },
      )
      .unwrap();

    let seen = seen.lock();
    assert_eq!(seen[0], (EventKind::Success, Some("ok".to_string()), vec![json!(1), json!("a")]));
    assert_eq!(seen[1], (EventKind::Failure, None, vec![json!("boom")]));
  }

  #[test]
  fn handler_errors_are_tagged_with_event() {
    let mut dispatcher = CallbackDispatcher::new();
    assert!(!dispatcher.has_handler(EventKind::Failure));
    dispatcher.set_failure(|_, _, _| Err(anyhow::anyhow!("handler broke")));
    assert!(dispatcher.has_handler(EventKind::Failure));

    let err = dispatcher
      .dispatch_outcome(
        &view(),
        &Outcome::Failure {
          id: None,
          kind: FailureKind::Crash,
          message: "worker terminated abnormally".to_string(),
        },
      )
      .unwrap_err();
    match err {
      PoolError::Callback { event, source } => {
        assert_eq!(event, EventKind::Failure);
        assert_eq!(source.to_string(), "handler broke");
      }
      other => panic!("expected callback error, got {:?}", other),
    }
  }

  #[test]
  fn missing_handlers_are_a_no_op() {
    let mut dispatcher = CallbackDispatcher::new();
    dispatcher.dispatch_assignment(&view(), None).unwrap();
    dispatcher
      .dispatch_outcome(
        &view(),
        &Outcome::Success {
          id: None,
          values: vec![],
        },
      )
      .unwrap();
  }
}
