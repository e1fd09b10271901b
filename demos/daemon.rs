use procpool::{request_stop, status, FileControl, ProcessPool, DEFAULT_HEARTBEAT_INTERVAL};
use std::time::Duration;
use tracing::{info, warn};

// Pretend work: a few CPU-bound rounds, with every fifth job failing.
fn crunch(job: u64) -> Result<(u64, u64), String> {
  if job % 5 == 4 {
    return Err(format!("job {} rejected its input", job));
  }
  let mut acc: u64 = job;
  for round in 0..2_000_000u64 {
    acc = acc.wrapping_mul(6364136223846793005).wrapping_add(round);
  }
  Ok((job, acc % 1000))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Daemon Example ---");

  let control_dir = std::env::temp_dir().join("procpool-daemon-demo");
  let pool_name = "crunch_daemon";

  let mut pool = ProcessPool::builder(pool_name)
    .capacity(3)
    .poll_interval(Duration::from_millis(50))
    .on_assignment(|view, id| {
      info!("Assigning {:?} ({} pending, {} active)", id, view.pending, view.active);
      Ok(())
    })
    .on_success(|_, id, values| {
      info!("{:?} finished with {:?}", id, values);
      Ok(())
    })
    .on_failure(|_, id, message| {
      warn!("{:?} failed: {}", id, message);
      Ok(())
    })
    .build()
    .expect("valid pool configuration");

  let control = match FileControl::acquire(&control_dir, pool_name, DEFAULT_HEARTBEAT_INTERVAL) {
    Ok(control) => control,
    Err(e) => {
      warn!("Cannot start: {}", e);
      return;
    }
  };
  info!("Pidfile at {}", control.files().pidfile.display());

  // Stand-in for an operator running the stop command from another shell.
  let stop_dir = control_dir.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_secs(3)).await;
    info!("Operator requests stop.");
    if let Err(e) = request_stop(&stop_dir, pool_name) {
      warn!("Failed to request stop: {}", e);
    }
  });

  let mut job = 0u64;
  loop {
    match pool.poll(&control) {
      Ok(true) => {}
      Ok(false) => break,
      Err(e) => {
        warn!("Handler error while polling: {}", e);
        break;
      }
    }
    if let Err(e) = pool.assign_with_id(format!("job-{}", job), move || crunch(job)).await {
      warn!("Could not assign job {}: {}", job, e);
      break;
    }
    job += 1;
  }

  match pool.stop(Duration::from_secs(2)).await {
    Ok(true) => info!("All workers finished before the deadline."),
    Ok(false) => warn!("Some workers were killed at the deadline."),
    Err(e) => warn!("Handler error during stop: {}", e),
  }

  info!(
    "Status before release: {:?}",
    status(&control_dir, pool_name, DEFAULT_HEARTBEAT_INTERVAL * 3)
  );
  drop(control);
  info!("Status after release: {:?}", status(&control_dir, pool_name, DEFAULT_HEARTBEAT_INTERVAL * 3));
  info!("--- Daemon Example Finished ---");
}
