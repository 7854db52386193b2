mod mpi;
mod slurm;

pub use mpi::MpiLauncher;
pub use slurm::SlurmLauncher;

use crate::config::Config;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fmt, fs, io,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
};
use thiserror::Error;

pub const LAUNCH_FILE: &str = "launch.txt";
pub const LAUNCHER_ENV: &str = "SIMCTL_LAUNCHER";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("no launcher specified; use -l or set ${LAUNCHER_ENV} (mpi, slurm, slurm-debug)")]
    NoLauncher,
    #[error("unknown launcher {0} (expected mpi, slurm or slurm-debug)")]
    UnknownLauncher(String),
    #[error("launch record {path} is malformed: {what}")]
    BadRecord { path: PathBuf, what: String },
    #[error("{exe} references libraries that cannot be loaded: {}", .missing.join(", "))]
    UnloadableBinary { exe: PathBuf, missing: Vec<String> },
    #[error("failed to inspect {exe} with ldd")]
    LddFailed { exe: PathBuf },
    #[error("could not determine the core count from lscpu")]
    NoCoreCount,
    #[error("slurm launches require --ntasks")]
    NtasksRequired,
    #[error("slurm launches require --time")]
    TimeRequired,
    #[error("slurm launches cannot run synchronously")]
    SynchronousUnsupported,
    #[error("sbatch did not accept the job: {output}")]
    SubmitRejected { output: String },
    #[error("illegal time (should be [mm|hh:mm:ss]): {0}")]
    BadTime(String),
    #[error("i/o error while launching")]
    Io(#[from] io::Error),
}

/// Lifecycle states, ordered from "nothing there" to "done".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    None,
    Initial,
    Queued,
    Running,
    Stopped,
    Finished,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Initial => "INITIAL",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    Mpi,
    Slurm,
    SlurmDebug,
}

impl LauncherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mpi => "mpi",
            Self::Slurm => "slurm",
            Self::SlurmDebug => "slurm-debug",
        }
    }

    /// Resolves `-l`, falling back to `$SIMCTL_LAUNCHER`.
    pub fn resolve(explicit: Option<&str>) -> Result<Self, LaunchError> {
        match explicit {
            Some(name) => name.parse(),
            None => match std::env::var(LAUNCHER_ENV) {
                Ok(name) => name.parse(),
                Err(_) => Err(LaunchError::NoLauncher),
            },
        }
    }
}

impl FromStr for LauncherKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpi" => Ok(Self::Mpi),
            "slurm" => Ok(Self::Slurm),
            "slurm-debug" => Ok(Self::SlurmDebug),
            other => Err(LaunchError::UnknownLauncher(other.to_string())),
        }
    }
}

/// `launch.txt`: one `key=value` per line, written wholesale at launch time
/// and treated as authoritative while it exists.
#[derive(Debug, Clone, Default)]
pub struct LaunchRecord {
    pairs: Vec<(String, String)>,
}

impl LaunchRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &str, value: String) {
        self.pairs.push((key.to_string(), value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn path(run: &Path) -> PathBuf {
        run.join(LAUNCH_FILE)
    }

    /// Returns None when the run has never been launched.
    pub fn read(run: &Path) -> Result<Option<Self>, LaunchError> {
        let path = Self::path(run);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut pairs = Vec::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            // values may contain '='; split on the first one only
            let (key, value) = line.split_once('=').ok_or_else(|| LaunchError::BadRecord {
                path: path.clone(),
                what: format!("line without '=': {line}"),
            })?;
            pairs.push((key.to_string(), value.to_string()));
        }
        Ok(Some(Self { pairs }))
    }

    pub fn write(&self, run: &Path) -> Result<(), LaunchError> {
        let mut out = fs::File::create(Self::path(run))?;
        for (key, value) in &self.pairs {
            writeln!(out, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Launch options common to all backends.
#[derive(Debug, Clone, Default)]
pub struct LaunchOpts {
    pub ntasks: Option<u32>,
    /// wall-clock request, `[mm|hh:mm:ss]`
    pub time: Option<String>,
    /// block until the model exits (small tests only)
    pub synchronous: bool,
}

/// The closed set of launch backends.  New backends are new variants here;
/// everything downstream dispatches over this enum.
pub enum Launchers {
    Mpi(MpiLauncher),
    Slurm(SlurmLauncher),
}

impl Launchers {
    pub fn new(kind: LauncherKind, run: &Path, config: &Config) -> Self {
        match kind {
            LauncherKind::Mpi => Self::Mpi(MpiLauncher::new(run)),
            LauncherKind::Slurm => Self::Slurm(SlurmLauncher::new(
                run,
                false,
                config.settings.slurm.account.clone(),
            )),
            LauncherKind::SlurmDebug => Self::Slurm(SlurmLauncher::new(
                run,
                true,
                config.settings.slurm.account.clone(),
            )),
        }
    }

    /// Rebuilds the backend a launch record was written by.
    pub fn for_record(record: &LaunchRecord, run: &Path, config: &Config) -> Result<Self, LaunchError> {
        let name = record.get("launcher").ok_or_else(|| LaunchError::BadRecord {
            path: LaunchRecord::path(run),
            what: "no launcher key".to_string(),
        })?;
        Ok(Self::new(name.parse()?, run, config))
    }

    pub fn launch(
        &self,
        mpi_cmd: &[String],
        modele_cmd: &[String],
        opts: &LaunchOpts,
    ) -> Result<LaunchRecord, LaunchError> {
        match self {
            Self::Mpi(launcher) => launcher.launch(mpi_cmd, modele_cmd, opts),
            Self::Slurm(launcher) => launcher.launch(mpi_cmd, modele_cmd, opts),
        }
    }

    /// What the backend knows about the run; `None` means it makes no claim
    /// and the caller falls back to on-disk heuristics.
    pub fn status(&self, record: &LaunchRecord) -> Result<Option<RunState>, LaunchError> {
        match self {
            Self::Mpi(launcher) => launcher.status(record),
            Self::Slurm(launcher) => launcher.status(record),
        }
    }

    pub fn kill(&self, record: &LaunchRecord) -> Result<(), LaunchError> {
        match self {
            Self::Mpi(launcher) => launcher.kill(record),
            Self::Slurm(launcher) => launcher.kill(record),
        }
    }

    pub fn ps(&self, record: &LaunchRecord, out: &mut dyn Write) -> Result<(), LaunchError> {
        match self {
            Self::Mpi(launcher) => launcher.ps(record, out),
            Self::Slurm(launcher) => launcher.ps(record, out),
        }
    }

    /// Blocks until the launch is believed to have taken hold.
    pub fn wait(&self) {
        match self {
            Self::Mpi(launcher) => launcher.wait(),
            Self::Slurm(_) => {
                // once sbatch accepted the job we are at least queued
            }
        }
    }
}

static NOT_FOUND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\S+)\s+=>\s+not found").unwrap());

/// Checks with ldd that a binary will actually load, listing every missing
/// library at once.
pub fn check_ldd(exe: &Path) -> Result<(), LaunchError> {
    let output = Command::new("ldd")
        .arg(exe)
        .output()
        .map_err(|_| LaunchError::LddFailed {
            exe: exe.to_path_buf(),
        })?;
    if !output.status.success() {
        return Err(LaunchError::LddFailed {
            exe: exe.to_path_buf(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let missing: Vec<String> = stdout
        .lines()
        .filter_map(|line| NOT_FOUND_RE.captures(line))
        .map(|caps| caps[1].to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(LaunchError::UnloadableBinary {
            exe: exe.to_path_buf(),
            missing,
        })
    }
}

static CPUS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^CPU\(s\):\s*(\d+)").unwrap());
static THREADS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Thread\(s\) per core:\s*(\d+)").unwrap());

/// Physical core count via lscpu (logical CPUs divided by SMT threads).
pub fn detect_ncores() -> Result<u32, LaunchError> {
    let output = Command::new("lscpu").output()?;
    parse_ncores(&String::from_utf8_lossy(&output.stdout))
}

fn parse_ncores(lscpu: &str) -> Result<u32, LaunchError> {
    let mut cpus = None;
    let mut threads = None;
    for line in lscpu.lines() {
        if let Some(caps) = CPUS_RE.captures(line) {
            cpus = caps[1].parse::<u32>().ok();
        } else if let Some(caps) = THREADS_RE.captures(line) {
            threads = caps[1].parse::<u32>().ok();
        }
    }
    match (cpus, threads) {
        (Some(cpus), Some(threads)) if threads > 0 => Ok(cpus / threads),
        (Some(cpus), None) => Ok(cpus),
        _ => Err(LaunchError::NoCoreCount),
    }
}

/// Converts a `[mm|hh:mm:ss]` wall-clock request to seconds.
pub fn time_to_seconds(stime: &str) -> Result<u64, LaunchError> {
    let parts: Vec<&str> = stime.split(':').collect();
    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| LaunchError::BadTime(stime.to_string()))
    };
    match parts.as_slice() {
        [minutes] => Ok(parse(minutes)? * 60),
        [hours, minutes, seconds] => {
            Ok(parse(hours)? * 3600 + parse(minutes)? * 60 + parse(seconds)?)
        }
        _ => Err(LaunchError::BadTime(stime.to_string())),
    }
}

#[cfg(test)]
mod launchers_test;
