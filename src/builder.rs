use crate::error::PoolError;
use crate::manager::ProcessPool;
use crate::notifier::{CallbackDispatcher, PoolView};

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

/// Tunables of a [`ProcessPool`]. Deserializable so a daemon can load it from
/// its own configuration file; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
  /// Maximum number of worker processes alive at once.
  pub capacity: usize,
  /// How often `run_until_stopped` checks its lifecycle control when idle.
  pub poll_interval_ms: u64,
  /// How long to wait for a buffered report after a worker has exited.
  pub drain_grace_ms: u64,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      capacity: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      poll_interval_ms: 100,
      drain_grace_ms: 100,
    }
  }
}

impl PoolConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn drain_grace(&self) -> Duration {
    Duration::from_millis(self.drain_grace_ms)
  }
}

/// Builds a [`ProcessPool`]. Handlers registered twice keep the last one.
pub struct PoolBuilder {
  pool_name: String,
  config: PoolConfig,
  dispatcher: CallbackDispatcher,
}

impl fmt::Debug for PoolBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolBuilder")
      .field("pool_name", &self.pool_name)
      .field("config", &self.config)
      .field("dispatcher", &self.dispatcher)
      .finish()
  }
}

impl PoolBuilder {
  pub fn new(pool_name: impl Into<String>) -> Self {
    Self {
      pool_name: pool_name.into(),
      config: PoolConfig::default(),
      dispatcher: CallbackDispatcher::new(),
    }
  }

  /// Replaces every tunable at once.
  pub fn config(mut self, config: PoolConfig) -> Self {
    self.config = config;
    self
  }

  pub fn capacity(mut self, capacity: usize) -> Self {
    self.config.capacity = capacity;
    self
  }

  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.config.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    self
  }

  pub fn drain_grace(mut self, grace: Duration) -> Self {
    self.config.drain_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
    self
  }

  pub fn on_assignment<F>(mut self, handler: F) -> Self
  where
    F: FnMut(&PoolView<'_>, Option<&str>) -> anyhow::Result<()> + Send + 'static,
  {
    self.dispatcher.set_assignment(handler);
    self
  }

  pub fn on_success<F>(mut self, handler: F) -> Self
  where
    F: FnMut(&PoolView<'_>, Option<&str>, &[Value]) -> anyhow::Result<()> + Send + 'static,
  {
    self.dispatcher.set_success(handler);
    self
  }

  pub fn on_failure<F>(mut self, handler: F) -> Self
  where
    F: FnMut(&PoolView<'_>, Option<&str>, &str) -> anyhow::Result<()> + Send + 'static,
  {
    self.dispatcher.set_failure(handler);
    self
  }

  /// Validates the name and configuration and creates the pool.
  ///
  /// The name is used for lifecycle control files, so it must be non-empty and
  /// must not contain path separators. Capacity must be between 1 and
  /// `Semaphore::MAX_PERMITS`.
  pub fn build(self) -> Result<ProcessPool, PoolError> {
    let name = self.pool_name.trim();
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
      return Err(PoolError::InvalidName(self.pool_name));
    }
    let capacity = self.config.capacity;
    if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
      return Err(PoolError::InvalidCapacity(capacity));
    }
    Ok(ProcessPool::from_parts(name.to_string(), self.config, self.dispatcher))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notifier::EventKind;

  #[test]
  fn defaults_are_sane() {
    let config = PoolConfig::default();
    assert!(config.capacity >= 1);
    assert_eq!(config.poll_interval(), Duration::from_millis(100));
    assert_eq!(config.drain_grace(), Duration::from_millis(100));
  }

  #[test]
  fn config_fills_missing_fields_from_defaults() {
    let config: PoolConfig = serde_json::from_str(r#"{"capacity": 3}"#).unwrap();
    assert_eq!(config.capacity, 3);
    assert_eq!(config.poll_interval_ms, 100);
  }

  #[test]
  fn invalid_names_are_rejected() {
    for name in ["", "   ", "a/b", "..", "c\\d"] {
      match PoolBuilder::new(name).capacity(1).build() {
        Err(PoolError::InvalidName(rejected)) => assert_eq!(rejected, name),
        Err(e) => panic!("expected InvalidName for {:?}, got {:?}", name, e),
        Ok(_) => panic!("expected InvalidName for {:?}, got a pool", name),
      }
    }
  }

  #[test]
  fn zero_capacity_is_rejected() {
    assert!(matches!(
      PoolBuilder::new("zero").capacity(0).build(),
      Err(PoolError::InvalidCapacity(0))
    ));
  }

  #[test]
  fn oversized_capacity_is_rejected() {
    let too_many = Semaphore::MAX_PERMITS + 1;
    match PoolBuilder::new("huge").capacity(too_many).build() {
      Err(PoolError::InvalidCapacity(rejected)) => assert_eq!(rejected, too_many),
      Err(e) => panic!("expected InvalidCapacity, got {:?}", e),
      Ok(_) => panic!("expected InvalidCapacity, got a pool"),
    }
    assert!(matches!(
      PoolBuilder::new("huge").capacity(usize::MAX).build(),
      Err(PoolError::InvalidCapacity(usize::MAX))
    ));
  }

  #[test]
  fn config_reaches_the_pool() {
    let config = PoolConfig {
      capacity: 4,
      poll_interval_ms: 25,
      drain_grace_ms: 40,
    };
    let pool = PoolBuilder::new("configured").config(config.clone()).build().unwrap();
    assert_eq!(pool.config(), &config);
    assert_eq!(pool.capacity(), 4);
  }

  #[test]
  fn huge_durations_saturate() {
    let builder = PoolBuilder::new("slow")
      .poll_interval(Duration::MAX)
      .drain_grace(Duration::from_millis(250));
    assert_eq!(builder.config.poll_interval_ms, u64::MAX);
    assert_eq!(builder.config.drain_grace_ms, 250);
  }

  #[test]
  fn builder_registers_handlers() {
    let pool = PoolBuilder::new("with_handlers")
      .capacity(2)
      .on_success(|_, _, _| Ok(()))
      .on_failure(|_, _, _| Ok(()))
      .build()
      .unwrap();
    assert_eq!(pool.capacity(), 2);
    assert!(!pool.has_handler(EventKind::Assignment));
    assert!(pool.has_handler(EventKind::Success));
    assert!(pool.has_handler(EventKind::Failure));
  }
}
