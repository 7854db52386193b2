//! `simctl` command line front end.

mod cache;
mod config;
mod hash;
mod keepalive;
mod launch;
mod launchers;
mod logdir;
mod mpivendors;
mod ncfile;
mod pathutil;
mod rundeck;
mod rundir;
mod setup;
mod wait;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::{crate_version, Args, Parser, Subcommand};
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cache::CacheError;
use crate::config::{Config, ConfigErrors};
use crate::keepalive::KeepaliveError;
use crate::launch::{LaunchCmdError, LaunchOptions};
use crate::rundir::RundirError;
use crate::setup::{SetupError, SetupOptions};

#[derive(Parser, Debug)]
#[command(name = "simctl", version = crate_version!())]
#[command(about = "Set up, build, launch and supervise model runs")]
struct Cli {
    /// Project root (holds simctl.conf).  Found automatically otherwise.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Launch flags shared by `start`, `run`, `resume` and `keepalive`.
#[derive(Args, Debug, Clone, Default)]
struct LaunchArgs {
    /// Launcher backend: mpi, slurm or slurm-debug
    #[arg(short, long)]
    launcher: Option<String>,

    /// Number of MPI ranks (detected from lscpu for the mpi launcher)
    #[arg(short = 'n', long)]
    ntasks: Option<u32>,

    /// Wall-clock request, [mm|hh:mm:ss]
    #[arg(short, long)]
    time: Option<String>,

    /// Model timespan, start[,end] in ISO-8601 (start only on cold starts)
    #[arg(long)]
    timespan: Option<String>,

    /// Skip the overwrite confirmation
    #[arg(short, long)]
    force: bool,

    /// Stay in the foreground until the model exits
    #[arg(short, long)]
    synchronous: bool,

    /// Do not register the run with the keepalive supervisor
    #[arg(long)]
    no_keepalive: bool,
}

impl LaunchArgs {
    fn to_options(&self) -> LaunchOptions {
        LaunchOptions {
            launcher: self.launcher.clone(),
            ntasks: self.ntasks,
            time: self.time.clone(),
            timespan: self.timespan.clone(),
            force: self.force,
            synchronous: self.synchronous,
            add_keepalive: !self.no_keepalive,
            ..LaunchOptions::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Associate a run directory with a rundeck and source tree, and build it
    Setup {
        /// Run directory (created if missing)
        #[arg(default_value = ".")]
        run: PathBuf,
        /// Resolved rundeck file to link in
        #[arg(long)]
        rundeck: Option<PathBuf>,
        /// Model source tree
        #[arg(long)]
        src: Option<PathBuf>,
        /// Rebuild the package even if it looks good
        #[arg(long)]
        rebuild: bool,
        /// Parallel make jobs
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Cold-start a run from its initial conditions
    Start {
        #[arg(default_value = ".")]
        run: PathBuf,
        #[command(flatten)]
        args: LaunchArgs,
    },

    /// Launch a run, warm-starting from its newest checkpoint
    #[command(alias = "launch")]
    Run {
        #[arg(default_value = ".")]
        run: PathBuf,
        /// Restart from this file instead of a checkpoint slot
        #[arg(long)]
        restart_file: Option<PathBuf>,
        #[command(flatten)]
        args: LaunchArgs,
    },

    /// Relaunch a run, reusing its control file verbatim
    #[command(alias = "restart")]
    Resume {
        #[arg(default_value = ".")]
        run: PathBuf,
        #[command(flatten)]
        args: LaunchArgs,
    },

    /// Show status, configuration and live processes of runs
    Ps {
        #[arg(default_value = ".")]
        runs: Vec<PathBuf>,
        /// Walk directories looking for runs
        #[arg(short, long)]
        recursive: bool,
    },

    /// Block until none of the given runs is RUNNING
    Wait {
        #[arg(default_value = ".")]
        runs: Vec<PathBuf>,
        /// Walk directories looking for runs
        #[arg(short, long)]
        recursive: bool,
    },

    /// Ask a run to stop at its next checkpoint
    Stop {
        #[arg(default_value = ".")]
        run: PathBuf,
        /// Kill the launcher's processes instead of waiting
        #[arg(short, long)]
        force: bool,
    },

    /// Garbage-collect builds and packages no run references
    Purge {
        /// Any directory under the project root
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Delete old inactivated entries as well
        #[arg(short, long)]
        force: bool,
    },

    /// Supervise registered runs, relaunching wall-time casualties
    Keepalive {
        /// Any directory under the project root
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Poll forever with this many seconds between passes
        #[arg(long)]
        every: Option<u64>,
        #[command(flatten)]
        args: LaunchArgs,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Launch(#[from] LaunchCmdError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Keepalive(#[from] KeepaliveError),
    #[error(transparent)]
    Rundir(#[from] RundirError),
    #[error("i/o error")]
    Io(#[from] io::Error),
}

/// Expands the positional run arguments, walking directories when asked.
fn expand_runs(given: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>, CliError> {
    if !recursive {
        return Ok(given.to_vec());
    }
    let mut runs = Vec::new();
    for dir in given {
        rundir::collect_runs(dir, &mut runs)?;
    }
    Ok(runs)
}

fn dispatch(cli: &Cli) -> Result<(), CliError> {
    let root = cli.root.as_deref();
    match &cli.command {
        Command::Setup {
            run,
            rundeck,
            src,
            rebuild,
            jobs,
        } => {
            let config = Config::for_run(root, run)?;
            let opts = SetupOptions {
                rundeck: rundeck.clone(),
                src: src.clone(),
                rebuild: *rebuild,
                jobs: *jobs,
            };
            setup::setup(&config, run, &opts)?;
        }
        Command::Start { run, args } => {
            let config = Config::for_run(root, run)?;
            let opts = LaunchOptions {
                cold: true,
                ..args.to_options()
            };
            launch::launch(&config, run, &opts)?;
        }
        Command::Run {
            run,
            restart_file,
            args,
        } => {
            let config = Config::for_run(root, run)?;
            let opts = LaunchOptions {
                restart_file: restart_file.clone(),
                ..args.to_options()
            };
            launch::launch(&config, run, &opts)?;
        }
        Command::Resume { run, args } => {
            let config = Config::for_run(root, run)?;
            // a resume is already supervised or deliberately not; it never
            // (re)registers itself
            let opts = LaunchOptions {
                keep_control: true,
                add_keepalive: false,
                ..args.to_options()
            };
            launch::launch(&config, run, &opts)?;
        }
        Command::Ps { runs, recursive } => {
            let mut out = io::stdout();
            for run in expand_runs(runs, *recursive)? {
                let config = Config::for_run(root, &run)?;
                launch::print_status(&config, &run, &mut out)?;
            }
        }
        Command::Wait { runs, recursive } => {
            let runs = expand_runs(runs, *recursive)?;
            if let Some(first) = runs.first() {
                let config = Config::for_run(root, first)?;
                wait::wait(&config, &runs);
            }
        }
        Command::Stop { run, force } => {
            let config = Config::for_run(root, run)?;
            launch::stop(&config, run, *force)?;
        }
        Command::Purge { dir, force } => {
            let config = Config::for_run(root, dir)?;
            cache::purge(&config, *force)?;
        }
        Command::Keepalive { dir, every, args } => {
            let config = Config::for_run(root, dir)?;
            let opts = args.to_options();
            keepalive::run(&config, &opts, every.map(Duration::from_secs))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod cli_test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    pub fn arguments_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    pub fn launches_register_for_keepalive_by_default() {
        assert!(LaunchArgs::default().to_options().add_keepalive);
        let suppressed = LaunchArgs {
            no_keepalive: true,
            ..LaunchArgs::default()
        };
        assert!(!suppressed.to_options().add_keepalive);
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(error) = dispatch(&cli) {
        error!(error = ?error, "{error}");
        std::process::exit(1);
    }
}
