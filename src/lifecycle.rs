//! The boundary to whatever decides when a pool should stop.
//!
//! The pool only needs a "should I keep running" signal ([`LifecycleControl`])
//! and reports through [`ProcessPool::stop`](crate::ProcessPool::stop) whether it
//! shut down within its deadline. Two controls ship with the crate:
//!
//! - [`StopSignal`], an in-process signal;
//! - [`FileControl`], a pidfile + liveness touch file protocol for running a
//!   pool as a daemon. A supervisor uses [`status`] and [`request_stop`] on the
//!   same directory to observe and stop it.

use crate::error::LifecycleError;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between liveness touches for [`FileControl`].
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Polled by the pool's control loop.
pub trait LifecycleControl {
  /// Whether the pool should stop accepting work and shut down.
  fn should_stop(&self) -> bool;

  /// Called on every control-loop step while the pool keeps running.
  fn heartbeat(&self) {}
}

/// An in-process stop signal. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
  token: CancellationToken,
}

impl StopSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn trigger(&self) {
    self.token.cancel();
  }

  pub fn is_triggered(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Completes once the signal has been triggered.
  pub async fn triggered(&self) {
    self.token.cancelled().await
  }
}

impl LifecycleControl for StopSignal {
  fn should_stop(&self) -> bool {
    self.is_triggered()
  }
}

/// Where a pool's control files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFiles {
  pub pidfile: PathBuf,
  pub alive_file: PathBuf,
  pub stop_file: PathBuf,
}

impl ControlFiles {
  pub fn new(dir: impl AsRef<Path>, pool_name: &str) -> Self {
    let dir = dir.as_ref();
    Self {
      pidfile: dir.join(format!("{}.pid", pool_name)),
      alive_file: dir.join(format!("{}.alive", pool_name)),
      stop_file: dir.join(format!("{}.stop", pool_name)),
    }
  }
}

/// What a supervisor sees when it inspects a pool's control files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
  /// No pidfile.
  Stopped,
  /// Pidfile present and the liveness file was touched recently.
  Running { pid: i32 },
  /// Pidfile present but the liveness file is missing or stale.
  Unresponsive { pid: i32 },
}

/// File-based lifecycle control for a pool running as a daemon.
///
/// Owns `<dir>/<name>.pid` while alive, rewrites `<dir>/<name>.alive` at most
/// once per heartbeat interval, and reports `should_stop` once
/// `<dir>/<name>.stop` appears or the pidfile is removed or taken over. The
/// files it owns are removed on drop.
#[derive(Debug)]
pub struct FileControl {
  files: ControlFiles,
  pid: i32,
  heartbeat_interval: Duration,
  last_heartbeat: Mutex<Option<Instant>>,
}

impl FileControl {
  /// Claims the pidfile for the current process.
  ///
  /// # Errors
  /// `AlreadyRunning` if another owner's pidfile is present and its liveness
  /// file is fresh; I/O errors from creating the files. A stale pidfile is
  /// replaced.
  pub fn acquire(dir: impl AsRef<Path>, pool_name: &str, heartbeat_interval: Duration) -> Result<Self, LifecycleError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let files = ControlFiles::new(dir, pool_name);
    let pid = std::process::id() as i32;

    // Three missed heartbeats make an owner stale.
    match status_of(&files, heartbeat_interval * 3)? {
      ServiceStatus::Running { pid: owner } if owner != pid => {
        return Err(LifecycleError::AlreadyRunning { pid: owner });
      }
      ServiceStatus::Unresponsive { pid: owner } => {
        warn!(pool_name, stale_pid = owner, "Replacing stale pidfile.");
      }
      _ => {}
    }

    remove_if_present(&files.stop_file)?;
    fs::write(&files.pidfile, format!("{}\n", pid))?;
    fs::write(&files.alive_file, unix_millis_now().to_string())?;
    info!(pool_name, pid, pidfile = %files.pidfile.display(), "Lifecycle control files acquired.");

    Ok(Self {
      files,
      pid,
      heartbeat_interval,
      last_heartbeat: Mutex::new(Some(Instant::now())),
    })
  }

  pub fn files(&self) -> &ControlFiles {
    &self.files
  }

  pub fn pid(&self) -> i32 {
    self.pid
  }

  fn owns_pidfile(&self) -> bool {
    matches!(read_pid(&self.files.pidfile), Ok(Some(pid)) if pid == self.pid)
  }
}

impl LifecycleControl for FileControl {
  fn should_stop(&self) -> bool {
    if self.files.stop_file.exists() {
      debug!(stop_file = %self.files.stop_file.display(), "Stop file present.");
      return true;
    }
    if !self.owns_pidfile() {
      debug!(pidfile = %self.files.pidfile.display(), "Pidfile removed or taken over.");
      return true;
    }
    false
  }

  fn heartbeat(&self) {
    let mut last = self.last_heartbeat.lock();
    if matches!(*last, Some(at) if at.elapsed() < self.heartbeat_interval) {
      return;
    }
    match fs::write(&self.files.alive_file, unix_millis_now().to_string()) {
      Ok(()) => *last = Some(Instant::now()),
      Err(e) => warn!(alive_file = %self.files.alive_file.display(), "Failed to touch liveness file: {}", e),
    }
  }
}

impl Drop for FileControl {
  fn drop(&mut self) {
    if self.owns_pidfile() {
      if let Err(e) = fs::remove_file(&self.files.pidfile) {
        warn!(pidfile = %self.files.pidfile.display(), "Failed to remove pidfile: {}", e);
      }
    }
    let _ = remove_if_present(&self.files.alive_file);
    let _ = remove_if_present(&self.files.stop_file);
    debug!(pid = self.pid, "Lifecycle control files released.");
  }
}

/// Asks the pool owning `<dir>/<name>.pid` to stop by creating its stop file.
pub fn request_stop(dir: impl AsRef<Path>, pool_name: &str) -> io::Result<()> {
  let files = ControlFiles::new(dir, pool_name);
  fs::write(&files.stop_file, unix_millis_now().to_string())?;
  info!(pool_name, stop_file = %files.stop_file.display(), "Stop requested.");
  Ok(())
}

/// Inspects the control files of `pool_name` in `dir`. A liveness file older
/// than `stale_after` makes the pool [`ServiceStatus::Unresponsive`].
pub fn status(dir: impl AsRef<Path>, pool_name: &str, stale_after: Duration) -> io::Result<ServiceStatus> {
  status_of(&ControlFiles::new(dir, pool_name), stale_after)
}

fn status_of(files: &ControlFiles, stale_after: Duration) -> io::Result<ServiceStatus> {
  let pid = match read_pid(&files.pidfile)? {
    Some(pid) => pid,
    None => return Ok(ServiceStatus::Stopped),
  };
  let fresh = match fs::metadata(&files.alive_file) {
    Ok(meta) => {
      let age = SystemTime::now()
        .duration_since(meta.modified()?)
        .unwrap_or(Duration::ZERO);
      age <= stale_after
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => false,
    Err(e) => return Err(e),
  };
  Ok(if fresh {
    ServiceStatus::Running { pid }
  } else {
    ServiceStatus::Unresponsive { pid }
  })
}

fn read_pid(pidfile: &Path) -> io::Result<Option<i32>> {
  match fs::read_to_string(pidfile) {
    Ok(contents) => contents
      .trim()
      .parse::<i32>()
      .map(Some)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("malformed pidfile {}: {}", pidfile.display(), e))),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e),
  }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
  match fs::remove_file(path) {
    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
    _ => Ok(()),
  }
}

fn unix_millis_now() -> u128 {
  SystemTime::now()
    .duration_since(SystemTime::UNIX_EPOCH)
    .map(|d| d.as_millis())
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stop_signal_is_shared_between_clones() {
    let signal = StopSignal::new();
    let observer = signal.clone();
    assert!(!observer.should_stop());
    signal.trigger();
    assert!(observer.should_stop());
  }

  #[test]
  fn control_file_names_follow_pool_name() {
    let files = ControlFiles::new("/run/pools", "mailer");
    assert_eq!(files.pidfile, PathBuf::from("/run/pools/mailer.pid"));
    assert_eq!(files.alive_file, PathBuf::from("/run/pools/mailer.alive"));
    assert_eq!(files.stop_file, PathBuf::from("/run/pools/mailer.stop"));
  }

  #[test]
  fn malformed_pidfile_is_invalid_data() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("broken.pid");
    fs::write(&pidfile, "not-a-pid").unwrap();
    let err = read_pid(&pidfile).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
  }

  #[test]
  fn missing_liveness_file_means_unresponsive() {
    let dir = tempfile::tempdir().unwrap();
    let files = ControlFiles::new(dir.path(), "quiet");
    fs::write(&files.pidfile, "4242\n").unwrap();
    assert_eq!(
      status_of(&files, Duration::from_secs(5)).unwrap(),
      ServiceStatus::Unresponsive { pid: 4242 }
    );
  }
}
