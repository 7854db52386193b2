//! Versioned log directories and post-mortem log digging.

use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fmt, fs,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum LogdirError {
    #[error("failed to create log directory under {0}")]
    Create(PathBuf, #[source] io::Error),
    #[error("{0} has no log directories")]
    NoLogs(PathBuf),
}

static LOG_N_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^log\.(\d+)$").unwrap());

/// Creates the next `log.N` directory in a run and repoints the `log`
/// symlink at it.
pub fn new_log_dir(run: &Path) -> Result<PathBuf, LogdirError> {
    let next = latest_index(run).map(|n| n + 1).unwrap_or(0);
    let log_dir = run.join(format!("log.{next}"));
    fs::create_dir_all(&log_dir).map_err(|e| LogdirError::Create(run.to_path_buf(), e))?;

    let link = run.join("log");
    match fs::remove_file(&link) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(LogdirError::Create(run.to_path_buf(), e)),
    }
    std::os::unix::fs::symlink(format!("log.{next}"), &link)
        .map_err(|e| LogdirError::Create(run.to_path_buf(), e))?;

    debug!("new log directory {}", log_dir.display());
    Ok(log_dir)
}

/// The most recent `log.N` directory of a run.
pub fn latest_log_dir(run: &Path) -> Result<PathBuf, LogdirError> {
    match latest_index(run) {
        Some(n) => Ok(run.join(format!("log.{n}"))),
        None => Err(LogdirError::NoLogs(run.to_path_buf())),
    }
}

fn latest_index(run: &Path) -> Option<u32> {
    let entries = fs::read_dir(run).ok()?;
    entries
        .filter_map(Result::ok)
        .filter_map(|e| {
            LOG_N_RE
                .captures(&e.file_name().to_string_lossy())
                .and_then(|caps| caps[1].parse().ok())
        })
        .max()
}

/// Why a stopped model exited, as announced in its own log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// reached the configured end of the simulated timespan
    FinishedTime,
    /// the user asked for a stop
    UserStopped,
    /// ran out of the requested wall-clock time
    MaxWtime,
    Signal15,
    Unknown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FinishedTime => "finished-time",
            Self::UserStopped => "user-stopped",
            Self::MaxWtime => "max-wtime",
            Self::Signal15 => "signal-15",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

static TERMINATED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Program terminated due to the following reason:").unwrap());
static REASON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(Terminated normally \(reached maximum time\))|(Run stopped with sswE)|(Reached maximum wall clock time\.)|(Got signal 15)",
    )
    .unwrap()
});

/// Digs the exit reason out of the tail of a rank-0 log file.
///
/// Two stages: find the termination announcement, then classify the line
/// right after it.  Anything unrecognized, including a missing or truncated
/// announcement, is `Unknown`; digging never fails.
pub fn dig_exit_reason(logfile: &Path, tail_bytes: u64) -> ExitReason {
    let tail = match read_tail(logfile, tail_bytes) {
        Ok(tail) => tail,
        Err(_) => return ExitReason::Unknown,
    };

    let mut lines = tail.lines();
    for line in lines.by_ref() {
        if TERMINATED_RE.is_match(line) {
            break;
        }
    }
    // only the line immediately following the announcement decides
    match lines.next() {
        Some(line) => classify_reason(line),
        None => ExitReason::Unknown,
    }
}

fn classify_reason(line: &str) -> ExitReason {
    match REASON_RE.captures(line) {
        Some(caps) => {
            if caps.get(1).is_some() {
                ExitReason::FinishedTime
            } else if caps.get(2).is_some() {
                ExitReason::UserStopped
            } else if caps.get(3).is_some() {
                ExitReason::MaxWtime
            } else {
                ExitReason::Signal15
            }
        }
        None => ExitReason::Unknown,
    }
}

fn read_tail(path: &Path, tail_bytes: u64) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    if tail_bytes > 0 && len > tail_bytes {
        file.seek(SeekFrom::Start(len - tail_bytes))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

#[cfg(test)]
mod logdir_test;
