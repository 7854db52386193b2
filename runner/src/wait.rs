use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::launchers::RunState;
use crate::rundir::Status;

/// Blocks until none of the given runs is RUNNING.  Polls once a second;
/// runs that are queued or stopped do not hold the wait open.
pub fn wait(config: &Config, runs: &[PathBuf]) {
    loop {
        let running: Vec<&PathBuf> = runs
            .iter()
            .filter(|run| Status::of(run, config).state == RunState::Running)
            .collect();
        if running.is_empty() {
            return;
        }
        info!("waiting on {} running job(s)", running.len());
        thread::sleep(Duration::from_secs(1));
    }
}
