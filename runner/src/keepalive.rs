//! The keepalive registry: runs that should be relaunched when they stop
//! for running out of wall-clock time.
//!
//! The registry is a newline-delimited list of absolute run paths next to a
//! `.lock` companion file.  Every read-modify-write happens under an
//! exclusive flock on the companion, so concurrent launches and supervisors
//! on the same deployment cannot lose each other's entries.  Relaunching
//! itself happens outside the lock; a relaunch can take minutes.

use crate::{
    config::Config,
    launch::{self, LaunchOptions},
    launchers::RunState,
    logdir::{self, ExitReason},
    mpivendors::MpiVendor,
    rundir::Status,
};
use nix::fcntl::{flock, FlockArg};
use std::{
    fs,
    io::{self, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum KeepaliveError {
    #[error("failed to access the keepalive registry {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to lock the keepalive registry {path}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// A sibling of the registry file, `<name><suffix>`, whatever the registry
/// happens to be called.
fn companion(registry: &Path, suffix: &str) -> PathBuf {
    let mut name = registry
        .file_name()
        .unwrap_or_default()
        .to_os_string();
    name.push(suffix);
    registry.with_file_name(name)
}

/// Holds the registry's flock for as long as it lives.
struct Lock {
    // the fd stays locked while the file handle is alive
    _file: fs::File,
}

impl Lock {
    fn acquire(registry: &Path) -> Result<Self, KeepaliveError> {
        let lock_path = companion(registry, ".lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| KeepaliveError::Io {
                path: lock_path.clone(),
                source,
            })?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|source| {
            KeepaliveError::Lock {
                path: lock_path,
                source,
            }
        })?;
        Ok(Self { _file: file })
    }
}

pub fn load(registry: &Path) -> Result<Vec<PathBuf>, KeepaliveError> {
    match fs::read_to_string(registry) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(KeepaliveError::Io {
            path: registry.to_path_buf(),
            source,
        }),
    }
}

fn save(registry: &Path, runs: &[PathBuf]) -> Result<(), KeepaliveError> {
    let io_err = |source| KeepaliveError::Io {
        path: registry.to_path_buf(),
        source,
    };
    let tmp = companion(registry, ".tmp");
    let mut out = fs::File::create(&tmp).map_err(io_err)?;
    for run in runs {
        writeln!(out, "{}", run.display()).map_err(io_err)?;
    }
    fs::rename(&tmp, registry).map_err(io_err)?;
    Ok(())
}

/// Registers a run, once.
pub fn add(config: &Config, run: &Path) -> Result<(), KeepaliveError> {
    let run = run.canonicalize().map_err(|source| KeepaliveError::Io {
        path: run.to_path_buf(),
        source,
    })?;

    let _lock = Lock::acquire(&config.keepalive)?;
    let mut runs = load(&config.keepalive)?;
    if !runs.contains(&run) {
        info!("registering {} for keepalive", run.display());
        runs.push(run);
        save(&config.keepalive, &runs)?;
    }
    Ok(())
}

/// What a poll decided about one registered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// still going (or not even started), leave it registered
    Keep,
    /// finished or stopped for a reason a relaunch would not fix
    Drop,
    /// ran out of wall-clock time, start it again
    Relaunch,
}

/// The supervision policy, separated from the file and process plumbing:
/// only a wall-clock timeout justifies a relaunch, and a relaunched run
/// stays registered.
pub fn decide(state: RunState, exit_reason: ExitReason) -> Action {
    if state < RunState::Stopped {
        return Action::Keep;
    }
    if state > RunState::Stopped {
        return Action::Drop;
    }
    match exit_reason {
        ExitReason::MaxWtime => Action::Relaunch,
        _ => Action::Drop,
    }
}

fn exit_reason_of(run: &Path) -> ExitReason {
    let log_dir = match logdir::latest_log_dir(run) {
        Ok(dir) => dir,
        Err(_) => return ExitReason::Unknown,
    };
    let logfile = MpiVendor::read_vendor(&log_dir)
        .and_then(|vendor| vendor.logfiles(&log_dir))
        .ok()
        .and_then(|files| files.into_iter().next());
    match logfile {
        Some(logfile) => logdir::dig_exit_reason(&logfile, 10_000),
        None => ExitReason::Unknown,
    }
}

/// One supervision pass over the registry.
///
/// The registry is read under the lock and released before any relaunching;
/// afterwards the lock is retaken and the drops are applied against the
/// then-current registry, so entries added in between survive.
pub fn poll_once(config: &Config, launch_opts: &LaunchOptions) -> Result<(), KeepaliveError> {
    let runs = {
        let _lock = Lock::acquire(&config.keepalive)?;
        load(&config.keepalive)?
    };
    if runs.is_empty() {
        return Ok(());
    }

    let mut drops = Vec::new();
    for run in &runs {
        let state = Status::of(run, config).state;
        let reason = if state == RunState::Stopped {
            exit_reason_of(run)
        } else {
            ExitReason::Unknown
        };
        let action = decide(state, reason);
        info!("{}: {state} -> {action:?}", run.display());

        match action {
            Action::Keep => {}
            Action::Drop => drops.push(run.clone()),
            Action::Relaunch => {
                info!("relaunching {} (exit reason {reason})", run.display());
                let opts = LaunchOptions {
                    // the control file of the interrupted run is reused
                    // as-is; registration must not recurse
                    keep_control: true,
                    add_keepalive: false,
                    force: true,
                    ..launch_opts.clone()
                };
                if let Err(error) = launch::launch(config, run, &opts) {
                    warn!(error = ?error, "relaunch of {} failed", run.display());
                }
            }
        }
    }

    if !drops.is_empty() {
        let _lock = Lock::acquire(&config.keepalive)?;
        let current = load(&config.keepalive)?;
        let kept: Vec<PathBuf> = current
            .into_iter()
            .filter(|run| !drops.contains(run))
            .collect();
        save(&config.keepalive, &kept)?;
    }
    Ok(())
}

/// Runs the supervisor: a single pass, or an endless loop with the given
/// interval between passes.
pub fn run(
    config: &Config,
    launch_opts: &LaunchOptions,
    every: Option<Duration>,
) -> Result<(), KeepaliveError> {
    match every {
        None => poll_once(config, launch_opts),
        Some(interval) => loop {
            poll_once(config, launch_opts)?;
            thread::sleep(interval);
        },
    }
}

#[cfg(test)]
mod keepalive_test;
