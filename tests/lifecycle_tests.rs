use procpool::{
  request_stop, status, ControlFiles, FileControl, LifecycleControl, LifecycleError, ProcessPool, ServiceStatus,
};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,procpool=debug"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[test]
fn test_acquire_writes_pidfile_and_reports_running() {
  setup_tracing_for_test();
  let dir = tempfile::tempdir().unwrap();
  let control = FileControl::acquire(dir.path(), "mailer", Duration::from_millis(200)).unwrap();

  let pid_contents = fs::read_to_string(&control.files().pidfile).unwrap();
  assert_eq!(pid_contents.trim(), std::process::id().to_string());
  assert!(control.files().alive_file.exists());
  assert_eq!(
    status(dir.path(), "mailer", Duration::from_secs(5)).unwrap(),
    ServiceStatus::Running { pid: control.pid() }
  );
  assert!(!control.should_stop());
}

#[test]
fn test_stop_file_and_pidfile_removal_request_stop() {
  setup_tracing_for_test();
  let dir = tempfile::tempdir().unwrap();

  let control = FileControl::acquire(dir.path(), "by_stop_file", Duration::from_millis(200)).unwrap();
  request_stop(dir.path(), "by_stop_file").unwrap();
  assert!(control.should_stop());
  drop(control);

  let control = FileControl::acquire(dir.path(), "by_pidfile", Duration::from_millis(200)).unwrap();
  fs::remove_file(&control.files().pidfile).unwrap();
  assert!(control.should_stop());
}

#[test]
fn test_acquire_clears_a_leftover_stop_request() {
  setup_tracing_for_test();
  let dir = tempfile::tempdir().unwrap();
  request_stop(dir.path(), "restart").unwrap();

  let control = FileControl::acquire(dir.path(), "restart", Duration::from_millis(200)).unwrap();
  assert!(!control.should_stop());
}

#[test]
fn test_live_owner_blocks_acquire_but_stale_owner_is_replaced() {
  setup_tracing_for_test();
  let dir = tempfile::tempdir().unwrap();
  let files = ControlFiles::new(dir.path(), "contended");
  let foreign_pid = std::process::id() as i32 + 1;

  fs::write(&files.pidfile, format!("{}\n", foreign_pid)).unwrap();
  fs::write(&files.alive_file, "0").unwrap();
  match FileControl::acquire(dir.path(), "contended", Duration::from_secs(1)) {
    Err(LifecycleError::AlreadyRunning { pid }) => assert_eq!(pid, foreign_pid),
    other => panic!("Expected AlreadyRunning, got {:?}", other),
  }

  // Without a liveness file the previous owner is considered gone.
  fs::remove_file(&files.alive_file).unwrap();
  assert_eq!(
    status(dir.path(), "contended", Duration::from_secs(1)).unwrap(),
    ServiceStatus::Unresponsive { pid: foreign_pid }
  );
  let control = FileControl::acquire(dir.path(), "contended", Duration::from_secs(1)).unwrap();
  assert_eq!(control.pid(), std::process::id() as i32);
}

#[test]
fn test_drop_releases_control_files() {
  setup_tracing_for_test();
  let dir = tempfile::tempdir().unwrap();
  let files = {
    let control = FileControl::acquire(dir.path(), "short_lived", Duration::from_millis(200)).unwrap();
    control.files().clone()
  };

  assert!(!files.pidfile.exists());
  assert!(!files.alive_file.exists());
  assert_eq!(
    status(dir.path(), "short_lived", Duration::from_secs(1)).unwrap(),
    ServiceStatus::Stopped
  );
}

#[test]
fn test_heartbeat_refreshes_liveness_file() {
  setup_tracing_for_test();
  let dir = tempfile::tempdir().unwrap();
  let control = FileControl::acquire(dir.path(), "beating", Duration::from_millis(10)).unwrap();
  let before = fs::read_to_string(&control.files().alive_file).unwrap();

  std::thread::sleep(Duration::from_millis(30));
  control.heartbeat();

  let after = fs::read_to_string(&control.files().alive_file).unwrap();
  assert!(after.parse::<u128>().unwrap() > before.parse::<u128>().unwrap());
}

#[tokio::test]
async fn test_file_control_drives_pool_shutdown() {
  setup_tracing_for_test();
  let dir = tempfile::tempdir().unwrap();
  let completed = Arc::new(AtomicUsize::new(0));
  let on_success = completed.clone();

  let mut pool = ProcessPool::builder("daemon_pool")
    .capacity(2)
    .poll_interval(Duration::from_millis(20))
    .on_success(move |_, _, _| {
      on_success.fetch_add(1, Ordering::SeqCst);
      Ok(())
    })
    .build()
    .unwrap();
  let control = FileControl::acquire(dir.path(), pool.name(), Duration::from_millis(50)).unwrap();

  pool
    .assign(|| {
      std::thread::sleep(Duration::from_millis(100));
      Ok::<_, String>(())
    })
    .await
    .unwrap();

  let stop_dir = dir.path().to_path_buf();
  tokio::spawn(async move {
    sleep(Duration::from_millis(250)).await;
    request_stop(&stop_dir, "daemon_pool").unwrap();
  });

  let stopped_in_time = timeout(
    Duration::from_secs(5),
    pool.run_until_stopped(&control, Duration::from_secs(2)),
  )
  .await
  .expect("pool did not observe the stop file")
  .unwrap();

  assert!(stopped_in_time);
  assert_eq!(completed.load(Ordering::SeqCst), 1);
  assert_eq!(
    status(dir.path(), "daemon_pool", Duration::from_secs(5)).unwrap(),
    ServiceStatus::Running { pid: control.pid() }
  );

  drop(control);
  assert_eq!(
    status(dir.path(), "daemon_pool", Duration::from_secs(5)).unwrap(),
    ServiceStatus::Stopped
  );
}
