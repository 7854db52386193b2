use super::{check_ldd, LaunchError, LaunchOpts, LaunchRecord, RunState};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::info;

pub(super) static SUBMITTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Submitted batch job\s+(\d+)").unwrap());
static INVALID_JOB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Invalid job id specified").unwrap());
static SCONTROL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([^\s=]+)=([^\s]+)").unwrap());

/// Submits to Slurm via sbatch and tracks the job through scontrol.
pub struct SlurmLauncher {
    run: PathBuf,
    debug: bool,
    account: Option<String>,
}

impl SlurmLauncher {
    pub fn new(run: &Path, debug: bool, account: Option<String>) -> Self {
        Self {
            run: run.to_path_buf(),
            debug,
            account,
        }
    }

    pub fn launch(
        &self,
        mpi_cmd: &[String],
        modele_cmd: &[String],
        opts: &LaunchOpts,
    ) -> Result<LaunchRecord, LaunchError> {
        let ntasks = opts.ntasks.ok_or(LaunchError::NtasksRequired)?;
        let time = opts.time.as_deref().ok_or(LaunchError::TimeRequired)?;
        if opts.synchronous {
            return Err(LaunchError::SynchronousUnsupported);
        }

        check_ldd(Path::new(&modele_cmd[0]))?;

        let cmd_str = format!("{} {}", mpi_cmd.join(" "), modele_cmd.join(" "));
        let script = format!("#!/bin/sh\n#\nulimit -s unlimited\n\n{cmd_str}\n");
        info!("{cmd_str}");

        let mut sbatch = Command::new("sbatch");
        sbatch
            .arg(format!("--job-name={}", self.run.display()))
            .arg(format!("--ntasks={ntasks}"))
            .arg(format!("--time={time}"));
        if let Some(account) = &self.account {
            sbatch.arg(format!("--account={account}"));
        }
        if self.debug {
            sbatch.arg("--qos=debug");
        }

        let mut child = sbatch
            .current_dir(&self.run)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // stdin is piped, take() cannot fail
        child
            .stdin
            .take()
            .ok_or(LaunchError::SubmitRejected {
                output: "sbatch stdin unavailable".to_string(),
            })?
            .write_all(script.as_bytes())?;
        let output = child.wait_with_output()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let jobid = match SUBMITTED_RE.captures(&stdout) {
            Some(caps) => caps[1].to_string(),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(LaunchError::SubmitRejected {
                    output: format!("{stdout}{stderr}"),
                });
            }
        };
        info!("submitted batch job {jobid}");

        let mut record = LaunchRecord::new();
        record.push(
            "launcher",
            if self.debug { "slurm-debug" } else { "slurm" }.to_string(),
        );
        record.push("jobid", jobid);
        record.push("mpi_cmd", mpi_cmd.join(" "));
        record.push("modele_cmd", modele_cmd.join(" "));
        record.push("cwd", self.run.display().to_string());
        record.write(&self.run)?;

        Ok(record)
    }

    fn jobid<'a>(&self, record: &'a LaunchRecord) -> Result<&'a str, LaunchError> {
        record.get("jobid").ok_or_else(|| LaunchError::BadRecord {
            path: LaunchRecord::path(&self.run),
            what: "no jobid key".to_string(),
        })
    }

    pub fn status(&self, record: &LaunchRecord) -> Result<Option<RunState>, LaunchError> {
        let output = Command::new("scontrol")
            .args(["show", "jobid", "-dd", self.jobid(record)?])
            .output()?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        // long-gone jobs are not an error, the disk heuristics take over
        if INVALID_JOB_RE.is_match(&stderr) {
            return Ok(None);
        }
        let fields = parse_scontrol(&String::from_utf8_lossy(&output.stdout));
        Ok(fields
            .get("JobState")
            .and_then(|state| translate_state(state)))
    }

    pub fn kill(&self, record: &LaunchRecord) -> Result<(), LaunchError> {
        Command::new("scancel").arg(self.jobid(record)?).status()?;
        Ok(())
    }

    pub fn ps(&self, record: &LaunchRecord, out: &mut dyn Write) -> Result<(), LaunchError> {
        let output = Command::new("scontrol")
            .args(["show", "jobid", "-dd", self.jobid(record)?])
            .output()?;
        out.write_all(&output.stdout)?;
        out.write_all(&output.stderr)?;
        Ok(())
    }
}

/// scontrol output is whitespace-separated KEY=VALUE pairs.
pub fn parse_scontrol(text: &str) -> BTreeMap<String, String> {
    SCONTROL_RE
        .captures_iter(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

pub(super) fn translate_state(slurm_state: &str) -> Option<RunState> {
    match slurm_state {
        "RUNNING" => Some(RunState::Running),
        "PENDING" => Some(RunState::Queued),
        // user cancellation and failures look the same from here
        "CANCELLED" | "FAILED" | "COMPLETED" => Some(RunState::Stopped),
        _ => None,
    }
}
