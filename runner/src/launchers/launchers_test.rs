use super::*;
use std::fs;

#[test]
pub fn states_order_by_progress() {
    assert!(RunState::None < RunState::Initial);
    assert!(RunState::Initial < RunState::Queued);
    assert!(RunState::Queued < RunState::Running);
    assert!(RunState::Running < RunState::Stopped);
    assert!(RunState::Stopped < RunState::Finished);
    assert_eq!(RunState::Stopped.to_string(), "STOPPED");
}

#[test]
pub fn kind_round_trips() {
    for kind in [LauncherKind::Mpi, LauncherKind::Slurm, LauncherKind::SlurmDebug] {
        assert_eq!(kind.as_str().parse::<LauncherKind>().unwrap(), kind);
    }
    assert!(matches!(
        "pbs".parse::<LauncherKind>(),
        Err(LaunchError::UnknownLauncher(_))
    ));
}

#[test]
pub fn record_splits_on_first_equals() {
    let run = tempfile::tempdir().unwrap();
    fs::write(
        run.path().join(LAUNCH_FILE),
        "launcher=mpi\nmodele_cmd=/x/bin/modelexe -i I --time=120\ncwd=/x\n",
    )
    .unwrap();

    let record = LaunchRecord::read(run.path()).unwrap().unwrap();
    assert_eq!(record.get("launcher"), Some("mpi"));
    assert_eq!(
        record.get("modele_cmd"),
        Some("/x/bin/modelexe -i I --time=120")
    );
    assert_eq!(record.get("nope"), None);
}

#[test]
pub fn record_absent_is_none() {
    let run = tempfile::tempdir().unwrap();
    assert!(LaunchRecord::read(run.path()).unwrap().is_none());
}

#[test]
pub fn record_write_read_round_trip() {
    let run = tempfile::tempdir().unwrap();
    let mut record = LaunchRecord::new();
    record.push("launcher", "slurm".to_string());
    record.push("jobid", "123456".to_string());
    record.write(run.path()).unwrap();

    let back = LaunchRecord::read(run.path()).unwrap().unwrap();
    assert_eq!(back.get("launcher"), Some("slurm"));
    assert_eq!(back.get("jobid"), Some("123456"));
}

#[test]
pub fn record_rejects_garbage() {
    let run = tempfile::tempdir().unwrap();
    fs::write(run.path().join(LAUNCH_FILE), "launcher=mpi\nnonsense\n").unwrap();
    assert!(matches!(
        LaunchRecord::read(run.path()),
        Err(LaunchError::BadRecord { .. })
    ));
}

#[test]
pub fn scontrol_parses_key_value_pairs() {
    let text = "JobId=4807158 JobName=/home/me/run1\n   \
                UserId=me(1001) GroupId=g(100)\n   \
                JobState=RUNNING Reason=None Dependency=(null)\n";
    let fields = slurm::parse_scontrol(text);
    assert_eq!(fields["JobId"], "4807158");
    assert_eq!(fields["JobState"], "RUNNING");
    assert_eq!(fields["Dependency"], "(null)");
}

#[test]
pub fn slurm_states_translate() {
    use slurm::translate_state;
    assert_eq!(translate_state("RUNNING"), Some(RunState::Running));
    assert_eq!(translate_state("PENDING"), Some(RunState::Queued));
    assert_eq!(translate_state("CANCELLED"), Some(RunState::Stopped));
    assert_eq!(translate_state("FAILED"), Some(RunState::Stopped));
    assert_eq!(translate_state("COMPLETED"), Some(RunState::Stopped));
    assert_eq!(translate_state("SPECIAL_EXIT"), None);
}

#[test]
pub fn sbatch_output_yields_job_id() {
    let caps = super::slurm::SUBMITTED_RE
        .captures("Submitted batch job 4807158\n")
        .unwrap();
    assert_eq!(&caps[1], "4807158");
    assert!(super::slurm::SUBMITTED_RE
        .captures("sbatch: error: invalid partition\n")
        .is_none());
}

#[test]
pub fn time_formats_convert_to_seconds() {
    assert_eq!(time_to_seconds("10").unwrap(), 600);
    assert_eq!(time_to_seconds("01:30:15").unwrap(), 5415);
    assert!(matches!(
        time_to_seconds("1:30"),
        Err(LaunchError::BadTime(_))
    ));
    assert!(matches!(
        time_to_seconds("soon"),
        Err(LaunchError::BadTime(_))
    ));
}

#[test]
pub fn lscpu_core_detection() {
    let lscpu = "Architecture:        x86_64\n\
                 CPU(s):              28\n\
                 Thread(s) per core:  2\n\
                 Core(s) per socket:  14\n";
    assert_eq!(parse_ncores(lscpu).unwrap(), 14);
    assert!(matches!(
        parse_ncores("Architecture: x86_64\n"),
        Err(LaunchError::NoCoreCount)
    ));
}
