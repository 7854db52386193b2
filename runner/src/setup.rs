//! Associating a run directory with a rundeck, a source tree, a build and a
//! package.

use crate::{
    cache,
    config::Config,
    launchers::RunState,
    rundeck::{Rundeck, RundeckError, RUNDECK_FILE},
    rundir::{RunPaths, Status},
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("no rundeck specified and none associated with {0}")]
    NoRundeck(PathBuf),
    #[error("no source directory specified and none associated with {0}")]
    NoSrc(PathBuf),
    #[error("source directory does not exist: {0}")]
    BadSrc(PathBuf),
    #[error("cannot change {what} of a run that has already progressed (from {old} to {new})")]
    Frozen {
        what: &'static str,
        old: PathBuf,
        new: PathBuf,
    },
    #[error(transparent)]
    Rundeck(#[from] RundeckError),
    #[error(transparent)]
    Cache(#[from] cache::CacheError),
    #[error("failed to prepare {0}")]
    Io(PathBuf, #[source] std::io::Error),
}

pub struct SetupOptions {
    pub rundeck: Option<PathBuf>,
    pub src: Option<PathBuf>,
    pub rebuild: bool,
    pub jobs: Option<usize>,
}

/// Checks the frozen-association invariant: once a run has progressed past
/// its initial state, the rundeck, source and build it was set up with may
/// not change.
fn check_frozen(
    state: RunState,
    what: &'static str,
    old: &Option<PathBuf>,
    new: &Path,
) -> Result<(), SetupError> {
    if state <= RunState::Initial {
        return Ok(());
    }
    match old {
        Some(old) if old != new => Err(SetupError::Frozen {
            what,
            old: old.clone(),
            new: new.to_path_buf(),
        }),
        _ => Ok(()),
    }
}

/// Sets up (or re-sets-up) a run directory.
///
/// Resolves the rundeck and source against what the run already carries,
/// computes the build and package hashes, links everything in, builds the
/// package if it is not already good, and writes a preview control file so
/// the user can inspect what a launch would feed the model.
pub fn setup(config: &Config, run: &Path, opts: &SetupOptions) -> Result<(), SetupError> {
    fs::create_dir_all(run).map_err(|e| SetupError::Io(run.to_path_buf(), e))?;

    let old = RunPaths::follow(run);
    let state = Status::of(run, config).state;

    let rundeck_path = opts
        .rundeck
        .as_ref()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
        .or_else(|| old.rundeck.clone())
        .ok_or_else(|| SetupError::NoRundeck(run.to_path_buf()))?;
    check_frozen(state, "rundeck", &old.rundeck, &rundeck_path)?;

    let src = opts
        .src
        .as_ref()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
        .or_else(|| old.src.clone())
        .ok_or_else(|| SetupError::NoSrc(run.to_path_buf()))?;
    if !src.is_dir() {
        return Err(SetupError::BadSrc(src));
    }
    check_frozen(state, "src", &old.src, &src)?;

    // link the rundeck into the run before loading it
    let link = run.join(RUNDECK_FILE);
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(|e| SetupError::Io(parent.to_path_buf(), e))?;
    }
    cache::set_link(&rundeck_path, &link)?;
    let rd = Rundeck::load(run)?;

    let build = config.builds.join(cache::build_hash(&rd, &src)?);
    check_frozen(state, "build", &old.build, &build)?;
    let pkg = config.pkgs.join(cache::pkg_hash(&rd, &src)?);

    info!("rundeck: {}", rundeck_path.display());
    info!("src:     {}", src.display());
    info!("build:   {}", build.display());
    info!("pkg:     {}", pkg.display());

    cache::set_link(&src, &run.join("src"))?;
    cache::set_link(&build, &run.join("build"))?;
    cache::set_link(&pkg, &run.join("pkg"))?;

    // build only when the package is not already complete
    if opts.rebuild || !cache::good_pkg(&pkg, &config.settings.required_artifacts) {
        let jobs = opts.jobs.unwrap_or_else(default_jobs);
        cache::ensure_built(config, &rundeck_path, &src, &build, &pkg, jobs)?;
    }

    // preview control file; launching rewrites it with the restart decision
    match rd.resolve_files(&config.settings.file_path) {
        Ok(resolved) => rd.write_control(run, &resolved)?,
        Err(error) => {
            // setup may run before the input files have been staged
            warn!("{error}; control file not written");
        }
    }
    Ok(())
}

pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
