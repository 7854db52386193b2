use super::{check_ldd, detect_ncores, time_to_seconds, LaunchError, LaunchOpts, LaunchRecord, RunState};
use nix::{sys::signal, unistd::Pid};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs, io,
    io::Write,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

pub const PID_FILE: &str = "modele.pid";

/// Runs mpirun directly on the local node.
///
/// mpirun writes its own pid file (`--report-pid`), which is what makes the
/// fire-and-forget spawn workable: liveness checks and kills go through that
/// pid rather than a managed child handle.
pub struct MpiLauncher {
    run: PathBuf,
}

impl MpiLauncher {
    pub fn new(run: &Path) -> Self {
        Self {
            run: run.to_path_buf(),
        }
    }

    fn pid_file(&self) -> PathBuf {
        self.run.join(PID_FILE)
    }

    pub fn launch(
        &self,
        mpi_cmd: &[String],
        modele_cmd: &[String],
        opts: &LaunchOpts,
    ) -> Result<LaunchRecord, LaunchError> {
        let ntasks = match opts.ntasks {
            Some(n) => n,
            None => detect_ncores()?,
        };

        let pid_file = self.pid_file();
        match fs::remove_file(&pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut mpi_cmd = mpi_cmd.to_vec();
        mpi_cmd.push("-np".to_string());
        mpi_cmd.push(ntasks.to_string());
        mpi_cmd.push("--report-pid".to_string());
        mpi_cmd.push(pid_file.display().to_string());

        let mut record = LaunchRecord::new();
        record.push("launcher", "mpi".to_string());
        record.push("pidfile", pid_file.display().to_string());
        record.push("mpi_cmd", mpi_cmd.join(" "));
        record.push("modele_cmd", modele_cmd.join(" "));
        record.push("cwd", self.run.display().to_string());
        record.write(&self.run)?;

        check_ldd(Path::new(&modele_cmd[0]))?;

        info!("{} {}", mpi_cmd.join(" "), modele_cmd.join(" "));

        let mut command = Command::new(&mpi_cmd[0]);
        command
            .args(&mpi_cmd[1..])
            .args(modele_cmd)
            .current_dir(&self.run);

        if opts.synchronous {
            let mut child = command.spawn()?;
            match &opts.time {
                Some(time) => {
                    let bound = Duration::from_secs(time_to_seconds(time)?);
                    if child.wait_timeout(bound)?.is_none() {
                        warn!("run exceeded {time}, killing it");
                        child.kill()?;
                        child.wait()?;
                    }
                }
                None => {
                    child.wait()?;
                }
            }
        } else {
            // own process group so the spawn survives this process
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .process_group(0)
                .spawn()?;
        }

        Ok(record)
    }

    fn top_pid(&self, record: &LaunchRecord) -> Option<i32> {
        let pid_file = record.get("pidfile")?;
        let text = fs::read_to_string(pid_file).ok()?;
        text.lines().next()?.trim().parse().ok()
    }

    pub fn status(&self, record: &LaunchRecord) -> Result<Option<RunState>, LaunchError> {
        match self.top_pid(record) {
            // signal 0 probes liveness without touching the process
            Some(pid) => match signal::kill(Pid::from_raw(pid), None) {
                Ok(()) => Ok(Some(RunState::Running)),
                Err(_) => Ok(None),
            },
            // launched but no pid file: the process never got going
            None => Ok(Some(RunState::Stopped)),
        }
    }

    pub fn kill(&self, record: &LaunchRecord) -> Result<(), LaunchError> {
        match self.top_pid(record) {
            Some(pid) => match signal::kill(Pid::from_raw(pid), signal::Signal::SIGKILL) {
                Ok(()) => {
                    info!("process {pid} successfully killed");
                    Ok(())
                }
                Err(_) => {
                    warn!("process {pid} seems to be already dead");
                    Ok(())
                }
            },
            None => {
                warn!("no pid file, nothing to kill");
                Ok(())
            }
        }
    }

    pub fn ps(&self, record: &LaunchRecord, out: &mut dyn Write) -> Result<(), LaunchError> {
        let top_pid = match self.top_pid(record) {
            Some(pid) => pid,
            None => {
                writeln!(out, "<No Running Processes>")?;
                return Ok(());
            }
        };

        let mut pids = vec![top_pid];
        if let Ok(output) = Command::new("pgrep").arg("-P").arg(top_pid.to_string()).output() {
            pids.extend(
                String::from_utf8_lossy(&output.stdout)
                    .split_whitespace()
                    .filter_map(|s| s.parse::<i32>().ok()),
            );
        }

        let output = Command::new("ps").arg("aux").output()?;
        let listing = String::from_utf8_lossy(&output.stdout);
        let mut lines = listing.lines();
        if let Some(header) = lines.next() {
            writeln!(out, "{header}")?;
        }
        for line in lines {
            if let Some(pid) = ps_pid(line) {
                if pids.contains(&pid) {
                    writeln!(out, "{line}")?;
                }
            }
        }
        Ok(())
    }

    /// Polls for the pid file so callers see a meaningful status right after
    /// an asynchronous launch.
    pub fn wait(&self) {
        for _ in 0..5 {
            if self.pid_file().exists() {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
        debug!("no pid file after 5s, giving up the wait");
    }
}

static PS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\S+\s+(\d+)\s").unwrap());

fn ps_pid(line: &str) -> Option<i32> {
    PS_RE.captures(line)?[1].parse().ok()
}
