use super::*;
use chrono::NaiveDate;
use std::fs;

const SAMPLE: &str = r#"
preamble:
  - "E4F40: Sample atmosphere run"
  - "second preamble line"
build:
  object_modules: [CLOUDS2, RADIATION]
  defines:
    TRACERS_ON: "YES"
params:
  dtsrc: "1800."
  kocean: "1"
inputz:
  ISTART: "2"
  START_TIME: "1950-01-01T00:00:00"
inputz_cold:
  KDIAG: "13*0"
files:
  AIC: AIC.RES_F40.D771201.nc
  TOPO: Z72X46N.cor4_nocasp
"#;

fn sample() -> Rundeck {
    serde_yaml::from_str(SAMPLE).unwrap()
}

fn write_sample(run: &Path) -> Rundeck {
    fs::create_dir_all(run.join("config")).unwrap();
    fs::write(run.join(RUNDECK_FILE), SAMPLE).unwrap();
    Rundeck::load(run).unwrap()
}

#[test]
pub fn loads_from_run_dir() {
    let run = tempfile::tempdir().unwrap();
    let rd = write_sample(run.path());
    assert_eq!(rd.params["dtsrc"], "1800.");
    assert!(rd.build.object_modules.contains("CLOUDS2"));
    assert_eq!(rd.files.len(), 2);
}

#[test]
pub fn cold_start_folds_inputz_cold() {
    let mut rd = sample();
    rd.fold_cold_start();
    assert_eq!(rd.inputz["KDIAG"], "13*0");
    assert!(rd.inputz_cold.is_empty());
}

#[test]
pub fn resolve_collects_all_failures() {
    let rd = sample();
    let err = rd.resolve_files(&[]).unwrap_err();
    match err {
        RundeckError::UnresolvedFiles(missing) => {
            assert_eq!(missing.len(), 2);
            assert!(missing[0].starts_with("AIC="));
            assert!(missing[1].starts_with("TOPO="));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
pub fn resolve_searches_the_path() {
    let data = tempfile::tempdir().unwrap();
    fs::write(data.path().join("AIC.RES_F40.D771201.nc"), b"x").unwrap();
    fs::write(data.path().join("Z72X46N.cor4_nocasp"), b"x").unwrap();

    let rd = sample();
    let resolved = rd.resolve_files(&[data.path().to_path_buf()]).unwrap();
    assert_eq!(resolved.len(), 2);
    assert!(resolved["AIC"].is_absolute());
}

#[test]
pub fn control_file_layout() {
    let run = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    fs::write(data.path().join("AIC.RES_F40.D771201.nc"), b"x").unwrap();
    fs::write(data.path().join("Z72X46N.cor4_nocasp"), b"x").unwrap();

    let mut rd = sample();
    rd.set_param("kdisk", "1");
    let resolved = rd.resolve_files(&[data.path().to_path_buf()]).unwrap();
    rd.write_control(run.path(), &resolved).unwrap();

    let text = fs::read_to_string(run.path().join("I")).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "E4F40: Sample atmosphere run");
    assert_eq!(lines[1], "&&PARAMETERS");
    assert!(lines.contains(&" dtsrc=1800."));
    assert!(lines.contains(&" kdisk=1"));
    assert!(text.contains(" _file_AIC='"));
    assert!(text.contains("&&END_PARAMETERS\n"));
    assert!(text.contains("&INPUTZ\n"));
    assert!(text.contains("ISTART=2,"));
    assert!(text.contains("YEARI=1950,MONTHI=1,DATEI=1,HOURI=0,"));
    assert!(text.contains("&INPUTZ_cold\n"));
    assert!(text.contains("KDIAG=13*0,"));

    // data files were linked in
    assert!(run.path().join("AIC").symlink_metadata().unwrap().file_type().is_symlink());
}

#[test]
pub fn control_file_rewrite_replaces_links() {
    let run = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    fs::write(data.path().join("AIC.RES_F40.D771201.nc"), b"x").unwrap();
    fs::write(data.path().join("Z72X46N.cor4_nocasp"), b"x").unwrap();

    let rd = sample();
    let resolved = rd.resolve_files(&[data.path().to_path_buf()]).unwrap();
    rd.write_control(run.path(), &resolved).unwrap();
    // second write must not trip over the existing symlinks
    rd.write_control(run.path(), &resolved).unwrap();
}

#[test]
pub fn end_time_must_be_on_the_hour() {
    let mut rd = sample();
    let ts = NaiveDate::from_ymd_opt(1960, 1, 1)
        .unwrap()
        .and_hms_opt(0, 30, 0)
        .unwrap();
    assert!(matches!(
        rd.set_end_time(ts),
        Err(RundeckError::NotOnTheHour(_))
    ));

    let ts = NaiveDate::from_ymd_opt(1960, 1, 1)
        .unwrap()
        .and_hms_opt(6, 0, 0)
        .unwrap();
    rd.set_end_time(ts).unwrap();
    assert_eq!(rd.inputz["END_TIME"], "1960-01-01T06:00:00");
}

#[test]
pub fn control_reads_back_verbatim() {
    let run = tempfile::tempdir().unwrap();
    let rd = sample();
    rd.write_control(run.path(), &BTreeMap::new()).unwrap();
    let text = read_control(run.path()).unwrap();
    assert_eq!(text, fs::read_to_string(run.path().join("I")).unwrap());
}
