//! Run directories: checkpoint slots, restart selection and run status.

use crate::{
    config::Config,
    launchers::{LaunchRecord, Launchers, RunState},
    ncfile::NcFile,
    pathutil,
    rundeck::{CONTROL_FILE, RUNDECK_FILE},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

/// The model alternates its checkpoints between exactly these two slots.
pub const SLOT_FILES: [&str; 2] = ["fort.1.nc", "fort.2.nc"];

pub const STOP_FILE: &str = "flagGoStop";
pub const STOP_CONTENT: &str = "__STOP__";

#[derive(Error, Debug)]
pub enum RundirError {
    #[error("corrupt checkpoint file(s), refusing to launch: {}", join_paths(.0))]
    CorruptSlots(Vec<PathBuf>),
    #[error("restart file does not exist: {0}")]
    NoRestartFile(PathBuf),
    #[error("cannot combine a cold start with an explicit restart file")]
    ColdWithRestartFile,
    #[error("cannot probe restart file")]
    BadRestartFile(#[from] crate::ncfile::NcError),
    #[error("failed to scan {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// What a single checkpoint slot holds.  Classification is recomputed from
/// disk on every call; nothing is cached across operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Good { itime: i32 },
    Missing,
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct Slot {
    /// 1-based index, the model's kdisk value
    pub kdisk: u8,
    pub path: PathBuf,
    pub state: SlotState,
}

/// Probes both checkpoint slots.  A file that exists but has no readable
/// `itime` is corrupt, not missing.
pub fn classify(run: &Path) -> [Slot; 2] {
    SLOT_FILES.map(|name| {
        let path = run.join(name);
        let kdisk = if name == SLOT_FILES[0] { 1 } else { 2 };
        let state = if !path.exists() {
            SlotState::Missing
        } else {
            match NcFile::open(&path).and_then(|mut nc| nc.read_scalar_int("itime")) {
                Ok(itime) => SlotState::Good { itime },
                Err(error) => {
                    warn!(error = ?error, "checkpoint {} is corrupt", path.display());
                    SlotState::Corrupt
                }
            }
        };
        Slot { kdisk, path, state }
    })
}

/// The model's own start codes (ISTART).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    Cold,
    Checkpoint,
    Rsf,
}

impl StartKind {
    pub fn istart(&self) -> u8 {
        match self {
            Self::Cold => 2,
            Self::Checkpoint => 14,
            Self::Rsf => 9,
        }
    }
}

/// A fully decided restart: how to start, from what, and which slot the
/// model writes first.
#[derive(Debug, Clone)]
pub struct Restart {
    pub kind: StartKind,
    pub source: Option<PathBuf>,
    pub kdisk: u8,
}

/// Decides the restart for a launch.
///
/// Warm starts resume from the newest good slot and direct the first
/// checkpoint write at the other slot, so the file being read from is never
/// the first one overwritten.  Any corrupt slot aborts the decision; the
/// user has to clean up by hand before relaunching.
pub fn choose_restart(
    slots: &[Slot; 2],
    explicit: Option<&Path>,
    cold: bool,
) -> Result<Restart, RundirError> {
    if cold && explicit.is_some() {
        return Err(RundirError::ColdWithRestartFile);
    }

    let corrupt: Vec<PathBuf> = slots
        .iter()
        .filter(|s| s.state == SlotState::Corrupt)
        .map(|s| s.path.clone())
        .collect();
    if !corrupt.is_empty() {
        return Err(RundirError::CorruptSlots(corrupt));
    }

    if cold {
        // predictable: a cold start always writes fort.1.nc first
        return Ok(Restart {
            kind: StartKind::Cold,
            source: None,
            kdisk: 1,
        });
    }

    if let Some(rsf) = explicit {
        if !rsf.exists() {
            return Err(RundirError::NoRestartFile(rsf.to_path_buf()));
        }
        // checkpoint files carry the accumulation arrays, plain restart
        // files do not
        let kind = if NcFile::open(rsf)?.has_variable("aij") {
            StartKind::Checkpoint
        } else {
            StartKind::Rsf
        };
        // write into a missing slot if there is one, else over the oldest;
        // the slot being restarted from is out of the running unless it is
        // the only slot left
        let candidates: Vec<&Slot> = slots
            .iter()
            .filter(|s| !same_file(rsf, &s.path))
            .collect();
        let candidates = if candidates.is_empty() {
            slots.iter().collect()
        } else {
            candidates
        };
        let kdisk = candidates
            .iter()
            .find(|s| s.state == SlotState::Missing)
            .or_else(|| {
                candidates.iter().min_by_key(|s| match s.state {
                    SlotState::Good { itime } => itime,
                    _ => i32::MAX,
                })
            })
            .map(|s| s.kdisk)
            .unwrap_or(1);
        return Ok(Restart {
            kind,
            source: Some(rsf.to_path_buf()),
            kdisk,
        });
    }

    // warm start from whatever the run has
    let newest = slots
        .iter()
        .filter_map(|s| match s.state {
            SlotState::Good { itime } => Some((itime, s)),
            _ => None,
        })
        .max_by_key(|(itime, _)| *itime);

    match newest {
        None => Ok(Restart {
            kind: StartKind::Cold,
            source: None,
            kdisk: 1,
        }),
        Some((itime, source)) => {
            debug!(
                "resuming from {} (itime={itime})",
                source.path.display()
            );
            Ok(Restart {
                kind: StartKind::Checkpoint,
                source: Some(source.path.clone()),
                // first write goes to the slot we are not reading from
                kdisk: other_kdisk(source.kdisk),
            })
        }
    }
}

fn other_kdisk(kdisk: u8) -> u8 {
    3 - kdisk
}

/// Whether two paths name the same file, seen through symlinks and relative
/// prefixes.
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// The symlinks a set-up run carries.  "No value" is a missing link.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run: PathBuf,
    pub rundeck: Option<PathBuf>,
    pub src: Option<PathBuf>,
    pub build: Option<PathBuf>,
    pub pkg: Option<PathBuf>,
}

impl RunPaths {
    pub fn follow(run: &Path) -> Self {
        Self {
            run: run.to_path_buf(),
            rundeck: pathutil::follow_link(&run.join(RUNDECK_FILE)),
            src: pathutil::follow_link(&run.join("src")),
            build: pathutil::follow_link(&run.join("build")),
            pkg: pathutil::follow_link(&run.join("pkg")),
        }
    }
}

static ACC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.acc.*\.nc$").unwrap());

/// A run's observed lifecycle state.
pub struct Status {
    pub run: PathBuf,
    pub state: RunState,
    pub record: Option<LaunchRecord>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.run.display(), self.state)
    }
}

impl Status {
    /// Determines run status.  The launch record's backend is authoritative
    /// while it has a claim; otherwise the state is inferred from what the
    /// run directory holds.
    pub fn of(run: &Path, config: &Config) -> Self {
        let record = match LaunchRecord::read(run) {
            Ok(record) => record,
            Err(error) => {
                warn!(error = ?error, "unreadable launch record in {}", run.display());
                None
            }
        };
        let state = Self::state_of(run, record.as_ref(), config);
        Self {
            run: run.to_path_buf(),
            state,
            record,
        }
    }

    fn state_of(run: &Path, record: Option<&LaunchRecord>, config: &Config) -> RunState {
        // a run without a control file has never been set up
        if !run.join(CONTROL_FILE).exists() {
            return RunState::None;
        }

        if let Some(record) = record {
            match Launchers::for_record(record, run, config)
                .and_then(|launcher| launcher.status(record))
            {
                Ok(Some(state)) => return state,
                Ok(None) => {}
                Err(error) => {
                    warn!(error = ?error, "backend status failed for {}", run.display());
                }
            }
        }

        // launched at some point, judge by the files left behind
        if SLOT_FILES.iter().any(|name| run.join(name).exists()) {
            return RunState::Stopped;
        }
        if has_acc_files(run) {
            return RunState::Finished;
        }
        RunState::Initial
    }
}

fn has_acc_files(run: &Path) -> bool {
    match std::fs::read_dir(run) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .any(|e| ACC_RE.is_match(&e.file_name().to_string_lossy())),
        Err(_) => false,
    }
}

/// Collects run directories below `dir`.  A directory with a rundeck link or
/// a control file is a run; runs are not descended into.
pub fn collect_runs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RundirError> {
    if dir.join(CONTROL_FILE).exists() || dir.join(RUNDECK_FILE).exists() {
        out.push(dir.to_path_buf());
        return Ok(());
    }
    let entries = std::fs::read_dir(dir).map_err(|source| RundirError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // the shared state directory holds builds and pkgs, never runs
        if name == crate::config::STATE_DIR || name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_runs(&path, out)?;
        }
    }
    Ok(())
}

/// Asks the model to stop at its next internal checkpoint.
pub fn request_stop(run: &Path) -> Result<(), RundirError> {
    std::fs::write(run.join(STOP_FILE), STOP_CONTENT).map_err(|source| RundirError::Io {
        path: run.join(STOP_FILE),
        source,
    })
}
