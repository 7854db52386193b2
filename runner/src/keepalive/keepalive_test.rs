use super::*;
use std::fs;

fn test_config() -> (tempfile::TempDir, Config) {
    let root = tempfile::tempdir().unwrap();
    let config = Config::at_root(root.path()).unwrap();
    (root, config)
}

#[test]
pub fn registry_starts_empty() {
    let (_root, config) = test_config();
    assert!(load(&config.keepalive).unwrap().is_empty());
}

#[test]
pub fn add_registers_each_run_once() {
    let (root, config) = test_config();
    let run = root.path().join("run1");
    fs::create_dir_all(&run).unwrap();

    add(&config, &run).unwrap();
    add(&config, &run).unwrap();

    let runs = load(&config.keepalive).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0], run.canonicalize().unwrap());

    // the lock companion exists afterwards
    assert!(config
        .keepalive
        .with_file_name("keepalive.txt.lock")
        .exists());
}

#[test]
pub fn companion_names_append_to_the_registry_name() {
    assert_eq!(
        companion(Path::new("/state/keepalive.txt"), ".lock"),
        PathBuf::from("/state/keepalive.txt.lock")
    );
    // no extension to lose
    assert_eq!(
        companion(Path::new("/state/registry"), ".tmp"),
        PathBuf::from("/state/registry.tmp")
    );
}

#[test]
pub fn add_appends_to_existing_entries() {
    let (root, config) = test_config();
    let run1 = root.path().join("run1");
    let run2 = root.path().join("run2");
    fs::create_dir_all(&run1).unwrap();
    fs::create_dir_all(&run2).unwrap();

    add(&config, &run1).unwrap();
    add(&config, &run2).unwrap();
    assert_eq!(load(&config.keepalive).unwrap().len(), 2);
}

#[test]
pub fn registry_tolerates_blank_lines() {
    let (_root, config) = test_config();
    fs::write(&config.keepalive, "/a/run\n\n  \n/b/run\n").unwrap();
    let runs = load(&config.keepalive).unwrap();
    assert_eq!(runs, vec![PathBuf::from("/a/run"), PathBuf::from("/b/run")]);
}

#[test]
pub fn only_wall_clock_timeouts_relaunch() {
    assert_eq!(
        decide(RunState::Stopped, ExitReason::MaxWtime),
        Action::Relaunch
    );
    assert_eq!(
        decide(RunState::Stopped, ExitReason::FinishedTime),
        Action::Drop
    );
    assert_eq!(
        decide(RunState::Stopped, ExitReason::UserStopped),
        Action::Drop
    );
    assert_eq!(
        decide(RunState::Stopped, ExitReason::Signal15),
        Action::Drop
    );
    assert_eq!(decide(RunState::Stopped, ExitReason::Unknown), Action::Drop);
}

#[test]
pub fn live_and_pending_runs_stay_registered() {
    for state in [
        RunState::None,
        RunState::Initial,
        RunState::Queued,
        RunState::Running,
    ] {
        assert_eq!(decide(state, ExitReason::Unknown), Action::Keep);
    }
    assert_eq!(decide(RunState::Finished, ExitReason::Unknown), Action::Drop);
}

#[test]
pub fn poll_drops_finished_runs_from_the_registry() {
    let (root, config) = test_config();
    // a run that finished: control file plus acc diagnostics, no forts
    let run = root.path().join("done");
    fs::create_dir_all(&run).unwrap();
    fs::write(run.join("I"), "E4F40\n").unwrap();
    fs::write(run.join("JAN1950.accE4F40.nc"), b"x").unwrap();
    // and one that has not started
    let fresh = root.path().join("fresh");
    fs::create_dir_all(&fresh).unwrap();
    fs::write(fresh.join("I"), "E4F40\n").unwrap();

    add(&config, &run).unwrap();
    add(&config, &fresh).unwrap();

    poll_once(&config, &LaunchOptions::default()).unwrap();
    let runs = load(&config.keepalive).unwrap();
    assert_eq!(runs, vec![fresh.canonicalize().unwrap()]);
}
