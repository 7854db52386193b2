//! Vendor-specific MPI handling.
//!
//! The mpirun flags that redirect per-rank output, and where the resulting
//! files land, differ between MPI implementations.  The vendor is detected
//! once per launch from the `mpirun -version` banner and recorded in the log
//! directory so later tooling reads logs without re-detecting.

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::debug;

pub const VENDOR_FILE: &str = "MPI.txt";

#[derive(Error, Debug)]
pub enum MpiError {
    #[error("cannot run mpirun -version")]
    NoMpirun(#[source] io::Error),
    #[error("cannot determine MPI vendor and version from: {0}")]
    UnknownVendor(String),
    #[error("unsupported OpenMPI major version {0}")]
    UnsupportedOpenMpi(u32),
    #[error("failed to read or write {VENDOR_FILE}")]
    VendorFile(#[from] io::Error),
}

static OPENMPI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"mpirun \(Open MPI\) (\d+)\.(\d+)\.(\d+)").unwrap());
static INTEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Intel\(R\) MPI Library for Linux\* OS, Version (\d+) Update (\d+)").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpiVendor {
    OpenMpi1 { version: Vec<u32> },
    OpenMpi3 { version: Vec<u32> },
    IntelMpi { version: Vec<u32> },
}

impl MpiVendor {
    /// Detects the vendor from the local `mpirun -version` banner.
    pub fn detect() -> Result<Self, MpiError> {
        let output = Command::new("mpirun")
            .arg("-version")
            .output()
            .map_err(MpiError::NoMpirun)?;
        let banner = String::from_utf8_lossy(&output.stdout).to_string();
        Self::from_banner(&banner)
    }

    fn from_banner(banner: &str) -> Result<Self, MpiError> {
        if let Some(caps) = OPENMPI_RE.captures(banner) {
            let version: Vec<u32> = (1..=3).map(|i| caps[i].parse().unwrap_or(0)).collect();
            return match version[0] {
                1 => Ok(Self::OpenMpi1 { version }),
                3 => Ok(Self::OpenMpi3 { version }),
                major => Err(MpiError::UnsupportedOpenMpi(major)),
            };
        }
        if let Some(caps) = INTEL_RE.captures(banner) {
            let version: Vec<u32> = (1..=2).map(|i| caps[i].parse().unwrap_or(0)).collect();
            return Ok(Self::IntelMpi { version });
        }
        Err(MpiError::UnknownVendor(banner.to_string()))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::OpenMpi1 { .. } | Self::OpenMpi3 { .. } => "openmpi",
            Self::IntelMpi { .. } => "impi",
        }
    }

    fn version(&self) -> &[u32] {
        match self {
            Self::OpenMpi1 { version } | Self::OpenMpi3 { version } | Self::IntelMpi { version } => {
                version
            }
        }
    }

    fn from_parts(name: &str, version: Vec<u32>) -> Result<Self, MpiError> {
        match (name, version.first().copied()) {
            ("openmpi", Some(1)) => Ok(Self::OpenMpi1 { version }),
            ("openmpi", Some(3)) => Ok(Self::OpenMpi3 { version }),
            ("openmpi", Some(major)) => Err(MpiError::UnsupportedOpenMpi(major)),
            ("impi", _) => Ok(Self::IntelMpi { version }),
            _ => Err(MpiError::UnknownVendor(name.to_string())),
        }
    }

    /// Records `vendor@x.y.z` in the log directory.
    pub fn write_vendor(&self, log_dir: &Path) -> Result<(), MpiError> {
        let version = self.version().iter().join(".");
        fs::write(
            log_dir.join(VENDOR_FILE),
            format!("{}@{version}\n", self.name()),
        )?;
        Ok(())
    }

    pub fn read_vendor(log_dir: &Path) -> Result<Self, MpiError> {
        let text = fs::read_to_string(log_dir.join(VENDOR_FILE))?;
        let line = text.lines().next().unwrap_or("");
        let (name, sversion) = line
            .split_once('@')
            .ok_or_else(|| MpiError::UnknownVendor(line.to_string()))?;
        let version: Vec<u32> = sversion
            .trim()
            .split('.')
            .filter_map(|x| x.parse().ok())
            .collect();
        Self::from_parts(name, version)
    }

    /// The mpirun invocation prefix, with per-rank output redirected into
    /// the log directory.
    pub fn cmd(&self, log_dir: &Path) -> Vec<String> {
        match self {
            Self::OpenMpi1 { .. } => vec![
                "mpirun".to_string(),
                "-timestamp-output".to_string(),
                "-output-filename".to_string(),
                log_dir.join("q").display().to_string(),
            ],
            Self::OpenMpi3 { .. } => vec![
                "mpirun".to_string(),
                "-timestamp-output".to_string(),
                "-merge-stderr-to-stdout".to_string(),
                "-output-filename".to_string(),
                log_dir.join("log").display().to_string(),
            ],
            Self::IntelMpi { .. } => vec![
                "mpirun".to_string(),
                "-outfile-pattern".to_string(),
                log_dir.join("%r").display().to_string(),
                "-errfile-pattern".to_string(),
                log_dir.join("err%r").display().to_string(),
            ],
        }
    }

    /// Uniform `<rank>` symlinks over the vendor's own log layout, so users
    /// can tail rank output without knowing which MPI produced it.
    pub fn make_symlinks(&self, log_dir: &Path, ntasks: u32) -> Result<(), MpiError> {
        let width = rank_width(ntasks);
        for rank in 0..ntasks {
            let link = log_dir.join(format!("{rank:0width$}"));
            let target = match self {
                Self::OpenMpi1 { .. } => PathBuf::from(format!("q.1.{rank:0width$}")),
                Self::OpenMpi3 { .. } => {
                    PathBuf::from(format!("log/1/rank.{rank:0width$}/stdout"))
                }
                Self::IntelMpi { .. } => {
                    // intel already writes plain per-rank files
                    debug!("no output symlinks for IntelMPI");
                    return Ok(());
                }
            };
            std::os::unix::fs::symlink(target, link)?;
        }
        Ok(())
    }

    /// The per-rank log files present in a log directory, sorted by rank.
    pub fn logfiles(&self, log_dir: &Path) -> Result<Vec<PathBuf>, MpiError> {
        let (dir, pattern) = match self {
            Self::OpenMpi1 { .. } => (log_dir.to_path_buf(), r"^q\.\d+\.(\d+)$"),
            Self::OpenMpi3 { .. } => (log_dir.join("log/1"), r"^rank\.(\d+)$"),
            Self::IntelMpi { .. } => (log_dir.to_path_buf(), r"^(\d+)$"),
        };
        let re = Regex::new(pattern).unwrap();
        let mut files: Vec<(u32, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)?.filter_map(Result::ok) {
            let name = entry.file_name();
            let name = name.to_string_lossy().to_string();
            if let Some(caps) = re.captures(&name) {
                let rank: u32 = caps[1].parse().unwrap_or(u32::MAX);
                let path = match self {
                    // the readable file is the stdout below the rank dir
                    Self::OpenMpi3 { .. } => entry.path().join("stdout"),
                    _ => entry.path(),
                };
                files.push((rank, path));
            }
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }
}

/// Number of digits MPI uses for rank numbers, from the task count.
fn rank_width(ntasks: u32) -> usize {
    ntasks.max(1).to_string().len()
}
