use super::*;
use chrono::NaiveDate;
use std::fs;

fn ts(y: i32, mo: u32, d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
}

#[test]
pub fn timespan_accepts_both_formats() {
    let (start, end) = parse_timespan(Some("19500101T000000Z,1960-01-01T00:00:00")).unwrap();
    assert_eq!(start, Some(ts(1950, 1, 1, 0)));
    assert_eq!(end, Some(ts(1960, 1, 1, 0)));
}

#[test]
pub fn timespan_start_only_and_empty_start() {
    let (start, end) = parse_timespan(Some("19500101T000000Z")).unwrap();
    assert_eq!(start, Some(ts(1950, 1, 1, 0)));
    assert_eq!(end, None);

    let (start, end) = parse_timespan(Some(",19600101T000000Z")).unwrap();
    assert_eq!(start, None);
    assert_eq!(end, Some(ts(1960, 1, 1, 0)));

    assert_eq!(parse_timespan(None).unwrap(), (None, None));
}

#[test]
pub fn timespan_rejects_garbage() {
    assert!(matches!(
        parse_timespan(Some("soon")),
        Err(LaunchCmdError::BadTimespan(_))
    ));
    assert!(matches!(
        parse_timespan(Some("a,b,c")),
        Err(LaunchCmdError::BadTimespan(_))
    ));
}

#[test]
pub fn net_time_keeps_a_shutdown_margin() {
    // 30 minutes requested, 3 minutes held back
    assert_eq!(net_time_s("30").unwrap(), 27 * 60);
    assert_eq!(net_time_s("01:00:00").unwrap(), 3600 - 180);
    // floor kicks in but stays below the request
    assert_eq!(net_time_s("00:05:00").unwrap(), 120);
}

#[test]
pub fn launching_without_a_package_link_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let config = Config::at_root(root.path()).unwrap();
    let run = root.path().join("run1");
    fs::create_dir_all(&run).unwrap();

    assert!(matches!(
        ensure_pkg(&config, &run),
        Err(LaunchCmdError::NotSetUp(_))
    ));
}

#[test]
pub fn complete_package_passes_the_preflight() {
    let root = tempfile::tempdir().unwrap();
    let config = Config::at_root(root.path()).unwrap();
    let pkg = root.path().join("simctl/pkgs/abc");
    fs::create_dir_all(pkg.join("bin")).unwrap();
    fs::create_dir_all(pkg.join("lib")).unwrap();
    fs::write(pkg.join("bin/modelexe"), b"x").unwrap();
    fs::write(pkg.join("lib/libmodele.so"), b"x").unwrap();

    let run = root.path().join("run1");
    fs::create_dir_all(&run).unwrap();
    std::os::unix::fs::symlink(&pkg, run.join("pkg")).unwrap();

    let found = ensure_pkg(&config, &run).unwrap();
    assert_eq!(found, pkg.canonicalize().unwrap());
}

#[test]
pub fn partial_package_without_links_cannot_rebuild() {
    let root = tempfile::tempdir().unwrap();
    let config = Config::at_root(root.path()).unwrap();
    let pkg = root.path().join("simctl/pkgs/abc");
    fs::create_dir_all(pkg.join("bin")).unwrap();
    fs::write(pkg.join("bin/modelexe"), b"x").unwrap();

    // no rundeck/src/build links to rebuild from
    let run = root.path().join("run1");
    fs::create_dir_all(&run).unwrap();
    std::os::unix::fs::symlink(&pkg, run.join("pkg")).unwrap();

    assert!(matches!(
        ensure_pkg(&config, &run),
        Err(LaunchCmdError::NotSetUp(_))
    ));
}

#[test]
pub fn tiny_time_requests_are_rejected() {
    assert!(matches!(net_time_s("2"), Err(LaunchCmdError::TimeTooSmall)));
    assert!(matches!(
        net_time_s("00:02:00"),
        Err(LaunchCmdError::TimeTooSmall)
    ));
}
