//! Launch orchestration: everything between "the user typed run" and
//! "mpirun or sbatch has the job".

use crate::{
    cache::{self, CacheError},
    config::Config,
    keepalive::{self, KeepaliveError},
    launchers::{
        self, time_to_seconds, LaunchError, LaunchOpts, LaunchRecord, LauncherKind, Launchers,
        RunState,
    },
    logdir::{self, LogdirError},
    mpivendors::{MpiError, MpiVendor},
    rundeck::{self, Rundeck, RundeckError},
    rundir::{self, Restart, RundirError, StartKind, Status},
    setup,
};
use chrono::NaiveDateTime;
use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

/// Wall-clock margin reserved for the model's own orderly shutdown.
const TIME_MARGIN_S: u64 = 3 * 60;

#[derive(Error, Debug)]
pub enum LaunchCmdError {
    #[error("run does not exist, cannot launch: {0}")]
    NoSuchRun(PathBuf),
    #[error("run is already running: {0}")]
    AlreadyRunning(PathBuf),
    #[error("run has no control file to resume from: {0}")]
    NothingToResume(PathBuf),
    #[error("--time is too small; should be at least 3 minutes over the 120s floor")]
    TimeTooSmall,
    #[error("invalid timespan {0} (expected [start][,end] in iso8601)")]
    BadTimespan(String),
    #[error("cannot set a start time in the middle of a run")]
    StartTimeMidRun,
    #[error("aborted by user")]
    Aborted,
    #[error("run has no package to launch; run setup first: {0}")]
    NotSetUp(PathBuf),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Launcher(#[from] LaunchError),
    #[error(transparent)]
    Rundir(#[from] RundirError),
    #[error(transparent)]
    Rundeck(#[from] RundeckError),
    #[error(transparent)]
    Logdir(#[from] LogdirError),
    #[error(transparent)]
    Mpi(#[from] MpiError),
    #[error(transparent)]
    Keepalive(#[from] KeepaliveError),
    #[error("i/o error during launch")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub launcher: Option<String>,
    pub ntasks: Option<u32>,
    /// wall-clock request, `[mm|hh:mm:ss]`
    pub time: Option<String>,
    /// `start[,end]` in iso8601
    pub timespan: Option<String>,
    pub restart_file: Option<PathBuf>,
    /// user asked for a cold start
    pub cold: bool,
    /// skip the cold-overwrite confirmation
    pub force: bool,
    /// reuse the existing control file verbatim
    pub keep_control: bool,
    pub synchronous: bool,
    pub add_keepalive: bool,
}

/// Steps the run from wherever it is into execution.
///
/// Everything up to the launcher hand-off only touches files inside the run
/// directory; a failure before that leaves no process behind.
pub fn launch(config: &Config, run: &Path, opts: &LaunchOptions) -> Result<(), LaunchCmdError> {
    let kind = LauncherKind::resolve(opts.launcher.as_deref())?;
    let (start_ts, end_ts) = parse_timespan(opts.timespan.as_deref())?;

    let state = Status::of(run, config).state;
    if state == RunState::None {
        return Err(LaunchCmdError::NoSuchRun(run.to_path_buf()));
    }
    if state == RunState::Running {
        return Err(LaunchCmdError::AlreadyRunning(run.to_path_buf()));
    }

    let slots = rundir::classify(run);
    let restart = rundir::choose_restart(&slots, opts.restart_file.as_deref(), opts.cold)?;

    announce(&restart);
    if restart.kind == StartKind::Cold && state >= RunState::Stopped && !opts.force {
        if !confirm("Run is STOPPED; do you wish to overwrite and restart?")? {
            return Err(LaunchCmdError::Aborted);
        }
    }
    if restart.kind != StartKind::Cold && start_ts.is_some() {
        return Err(LaunchCmdError::StartTimeMidRun);
    }

    ensure_pkg(config, run)?;

    let log_dir = logdir::new_log_dir(run)?;

    if opts.keep_control {
        // resume with exactly the parameters of the interrupted run
        rundeck::read_control(run)
            .map_err(|_| LaunchCmdError::NothingToResume(run.to_path_buf()))?;
        info!("reusing the existing control file");
    } else {
        write_control(config, run, &restart, start_ts, end_ts)?;
    }

    let ntasks = match opts.ntasks {
        Some(n) => n,
        None => launchers::detect_ncores()?,
    };

    let vendor = MpiVendor::detect()?;
    let mpi_cmd = vendor.cmd(&log_dir);
    vendor.write_vendor(&log_dir)?;
    vendor.make_symlinks(&log_dir, ntasks)?;

    // stale per-step timing would be misleading after a relaunch
    match fs::remove_file(run.join("timestep.txt")) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove timestep.txt: {e}"),
    }

    let mut modele_cmd = vec![
        run.join("pkg/bin/modelexe").display().to_string(),
        "-i".to_string(),
        rundeck::CONTROL_FILE.to_string(),
    ];
    if let Some(time) = &opts.time {
        modele_cmd.push("--time".to_string());
        modele_cmd.push(net_time_s(time)?.to_string());
    }

    let launcher = Launchers::new(kind, run, config);
    launcher.launch(
        &mpi_cmd,
        &modele_cmd,
        &LaunchOpts {
            ntasks: Some(ntasks),
            time: opts.time.clone(),
            synchronous: opts.synchronous,
        },
    )?;

    if !opts.synchronous {
        launcher.wait();
        print_status(config, run, &mut io::stdout())?;
    }

    if opts.add_keepalive {
        keepalive::add(config, run)?;
    }
    Ok(())
}

/// Verifies the run's package actually carries the model before anything is
/// launched.  An incomplete package (a crashed or interrupted build) is
/// rebuilt in place; a run that was never set up is refused.
fn ensure_pkg(config: &Config, run: &Path) -> Result<PathBuf, LaunchCmdError> {
    let paths = rundir::RunPaths::follow(run);
    let pkg = paths
        .pkg
        .ok_or_else(|| LaunchCmdError::NotSetUp(run.to_path_buf()))?;
    if cache::good_pkg(&pkg, &config.settings.required_artifacts) {
        return Ok(pkg);
    }
    let (rundeck, src, build) = match (paths.rundeck, paths.src, paths.build) {
        (Some(rundeck), Some(src), Some(build)) => (rundeck, src, build),
        _ => return Err(LaunchCmdError::NotSetUp(run.to_path_buf())),
    };
    warn!("package {} is incomplete, rebuilding", pkg.display());
    cache::ensure_built(config, &rundeck, &src, &build, &pkg, setup::default_jobs())?;
    Ok(pkg)
}

fn announce(restart: &Restart) {
    match (&restart.kind, &restart.source) {
        (StartKind::Cold, _) => info!("***** cold start"),
        (_, Some(source)) => info!("***** warm start from {}", source.display()),
        _ => {}
    }
    info!("first checkpoint file will be fort.{}.nc", restart.kdisk);
}

/// Rebuilds the control file for this launch: cold-start folding, the
/// restart decision, timespan bounds, then the flattened write.
fn write_control(
    config: &Config,
    run: &Path,
    restart: &Restart,
    start_ts: Option<NaiveDateTime>,
    end_ts: Option<NaiveDateTime>,
) -> Result<(), LaunchCmdError> {
    let mut rd = Rundeck::load(run)?;

    if restart.kind == StartKind::Cold {
        rd.fold_cold_start();
    } else {
        rd.inputz_cold.clear();
    }

    rd.set_inputz("ISTART", &restart.kind.istart().to_string());
    if let Some(source) = &restart.source {
        match restart.kind {
            // plain restart files enter as the AIC initial condition,
            // checkpoints through the model's fort.4.nc slot
            StartKind::Rsf => rd.set_file("AIC", &source.display().to_string()),
            StartKind::Checkpoint => rd.set_file("fort.4.nc", &source.display().to_string()),
            StartKind::Cold => {}
        }
    }
    rd.set_param("kdisk", &restart.kdisk.to_string());

    if let Some(ts) = start_ts {
        rd.set_start_time(ts)?;
    }
    if let Some(ts) = end_ts {
        rd.set_end_time(ts)?;
    }

    let resolved = rd.resolve_files(&config.settings.file_path)?;
    rd.write_control(run, &resolved)?;
    Ok(())
}

/// The `--time` handed to the model, with a shutdown margin subtracted.
fn net_time_s(time: &str) -> Result<u64, LaunchCmdError> {
    let time_s = time_to_seconds(time)?;
    let net = std::cmp::max(120, time_s.saturating_sub(TIME_MARGIN_S));
    if net >= time_s {
        return Err(LaunchCmdError::TimeTooSmall);
    }
    Ok(net)
}

/// `start[,end]`, each optional, `YYYYmmddTHHMMSSZ` or `YYYY-mm-ddTHH:MM:SS`.
pub fn parse_timespan(
    timespan: Option<&str>,
) -> Result<(Option<NaiveDateTime>, Option<NaiveDateTime>), LaunchCmdError> {
    let Some(timespan) = timespan else {
        return Ok((None, None));
    };
    let parts: Vec<&str> = timespan.split(',').map(str::trim).collect();
    let parse = |s: &str| -> Result<Option<NaiveDateTime>, LaunchCmdError> {
        if s.is_empty() {
            return Ok(None);
        }
        for format in ["%Y%m%dT%H%M%SZ", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(Some(ts));
            }
        }
        Err(LaunchCmdError::BadTimespan(timespan.to_string()))
    };
    match parts.as_slice() {
        [start] => Ok((parse(start)?, None)),
        [start, end] => Ok((parse(start)?, parse(end)?)),
        _ => Err(LaunchCmdError::BadTimespan(timespan.to_string())),
    }
}

/// Prints a run's status, configuration links and live processes.
pub fn print_status(
    config: &Config,
    run: &Path,
    out: &mut dyn Write,
) -> Result<(), LaunchCmdError> {
    let status = Status::of(run, config);
    let name = run
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| run.display().to_string());

    writeln!(out, "============================ {name}")?;
    writeln!(out, "status:  {}", status.state)?;

    let paths = rundir::RunPaths::follow(run);
    if let Some(rundeck) = &paths.rundeck {
        writeln!(out, "rundeck: {}", rundeck.display())?;
    }
    if let Some(pkg) = &paths.pkg {
        writeln!(out, "pkg:     {}", pkg.display())?;
    }

    if let Some(record) = &status.record {
        let launcher = Launchers::for_record(record, run, config)?;
        launcher.ps(record, out)?;
    }
    Ok(())
}

/// Asks the model to stop at its next checkpoint; `force` kills it instead.
pub fn stop(config: &Config, run: &Path, force: bool) -> Result<(), LaunchCmdError> {
    rundir::request_stop(run)?;
    info!("stop requested for {}", run.display());

    if force {
        if let Some(record) = LaunchRecord::read(run)? {
            let launcher = Launchers::for_record(&record, run, config)?;
            launcher.kill(&record)?;
        } else {
            warn!("never launched, nothing to kill");
        }
    }
    print_status(config, run, &mut io::stdout())
}

fn confirm(prompt: &str) -> Result<bool, LaunchCmdError> {
    let mut out = io::stdout();
    write!(out, "{prompt} [y/N] ")?;
    out.flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
mod launch_test;
