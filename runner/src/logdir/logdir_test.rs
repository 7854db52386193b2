use super::*;
use std::fs;

#[test]
pub fn log_dirs_are_numbered_and_linked() {
    let run = tempfile::tempdir().unwrap();

    let first = new_log_dir(run.path()).unwrap();
    assert_eq!(first, run.path().join("log.0"));
    let second = new_log_dir(run.path()).unwrap();
    assert_eq!(second, run.path().join("log.1"));

    assert_eq!(
        fs::read_link(run.path().join("log")).unwrap(),
        PathBuf::from("log.1")
    );
    assert_eq!(latest_log_dir(run.path()).unwrap(), second);
}

#[test]
pub fn latest_without_any_logs_is_an_error() {
    let run = tempfile::tempdir().unwrap();
    assert!(matches!(
        latest_log_dir(run.path()),
        Err(LogdirError::NoLogs(_))
    ));
}

fn dig(text: &str) -> ExitReason {
    let dir = tempfile::tempdir().unwrap();
    let logfile = dir.path().join("q.1.0");
    fs::write(&logfile, text).unwrap();
    dig_exit_reason(&logfile, 10_000)
}

#[test]
pub fn digs_each_exit_reason() {
    let announce = "Program terminated due to the following reason:\n";
    assert_eq!(
        dig(&format!(
            "{announce} >>  Terminated normally (reached maximum time)  <<\n"
        )),
        ExitReason::FinishedTime
    );
    assert_eq!(
        dig(&format!("{announce} >>  Run stopped with sswE  <<\n")),
        ExitReason::UserStopped
    );
    assert_eq!(
        dig(&format!(
            "{announce} >>  Reached maximum wall clock time.  <<\n"
        )),
        ExitReason::MaxWtime
    );
    assert_eq!(
        dig(&format!("{announce} >>  Got signal 15  <<\n")),
        ExitReason::Signal15
    );
}

#[test]
pub fn only_the_line_after_the_announcement_counts() {
    // the reason text elsewhere in the log must not match
    let text = "Run stopped with sswE\n\
                some chatter\n\
                Program terminated due to the following reason:\n\
                something unexpected\n\
                Got signal 15\n";
    assert_eq!(dig(text), ExitReason::Unknown);
}

#[test]
pub fn missing_announcement_is_unknown() {
    assert_eq!(dig("clean log, nothing special\n"), ExitReason::Unknown);
    assert_eq!(
        dig("Program terminated due to the following reason:"),
        ExitReason::Unknown
    );
}

#[test]
pub fn unreadable_log_is_unknown() {
    assert_eq!(
        dig_exit_reason(Path::new("/no/such/log"), 1024),
        ExitReason::Unknown
    );
}

#[test]
pub fn digging_reads_only_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let logfile = dir.path().join("q.1.0");
    let mut text = String::new();
    text.push_str("Program terminated due to the following reason:\n");
    text.push_str(" >>  Run stopped with sswE  <<\n");
    for _ in 0..2000 {
        text.push_str("filler line that pushes the announcement out of the tail\n");
    }
    fs::write(&logfile, &text).unwrap();
    assert_eq!(dig_exit_reason(&logfile, 1024), ExitReason::Unknown);
}
