//! Resolved run configuration.
//!
//! The legacy rundeck template language is handled by external tooling; what
//! lands in a run is its structured output, `config/rundeck.yaml`.  This
//! module loads that file, applies launch-time modifications, resolves the
//! input data files and flattens everything into the `I` control file the
//! model reads at startup.

use crate::pathutil;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const RUNDECK_FILE: &str = "config/rundeck.yaml";
pub const CONTROL_FILE: &str = "I";

#[derive(Error, Debug)]
pub enum RundeckError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("could not resolve input files: {}", .0.join(", "))]
    UnresolvedFiles(Vec<String>),
    #[error("{key} is not an iso8601 timestamp: {value}")]
    BadTimestamp { key: String, value: String },
    #[error("{0} must be on the hour")]
    NotOnTheHour(String),
}

/// Build-relevant half of the rundeck.  This is what feeds the build hash,
/// so it only carries fields that change the compiled model.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildSpec {
    #[serde(default)]
    pub object_modules: BTreeSet<String>,
    #[serde(default)]
    pub components: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub defines: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Rundeck {
    /// first line becomes the control file header
    pub preamble: Vec<String>,
    #[serde(default)]
    pub build: BuildSpec,
    /// runtime parameters (`&&PARAMETERS` section)
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// `&INPUTZ` namelist; `START_TIME`/`END_TIME` hold iso8601 timestamps
    #[serde(default)]
    pub inputz: BTreeMap<String, String>,
    /// folded into `inputz` on a cold start, dropped otherwise
    #[serde(default)]
    pub inputz_cold: BTreeMap<String, String>,
    /// input data files by label, unresolved names or absolute paths
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Rundeck {
    pub fn load(run: &Path) -> Result<Self, RundeckError> {
        let path = run.join(RUNDECK_FILE);
        let text = fs::read_to_string(&path).map_err(|source| RundeckError::Io {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| RundeckError::Parse { path, source })
    }

    /// Folds `inputz_cold` over `inputz`.  This replaces the model's own
    /// `-cold-restart` handling of the second namelist read.
    pub fn fold_cold_start(&mut self) {
        let cold = std::mem::take(&mut self.inputz_cold);
        for (key, value) in cold {
            self.inputz.insert(key, value);
        }
    }

    pub fn set_param(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn set_file(&mut self, label: &str, path: &str) {
        self.files.insert(label.to_string(), path.to_string());
    }

    pub fn set_inputz(&mut self, key: &str, value: &str) {
        self.inputz.insert(key.to_string(), value.to_string());
    }

    /// Sets the simulation start time.  Only legal on a cold start; the
    /// caller enforces that.
    pub fn set_start_time(&mut self, ts: NaiveDateTime) -> Result<(), RundeckError> {
        if ts.minute() != 0 || ts.second() != 0 {
            return Err(RundeckError::NotOnTheHour("START_TIME".to_string()));
        }
        self.inputz
            .insert("START_TIME".to_string(), format_ts(ts));
        Ok(())
    }

    pub fn set_end_time(&mut self, ts: NaiveDateTime) -> Result<(), RundeckError> {
        if ts.minute() != 0 || ts.second() != 0 {
            return Err(RundeckError::NotOnTheHour("END_TIME".to_string()));
        }
        self.inputz.insert("END_TIME".to_string(), format_ts(ts));
        Ok(())
    }

    /// Resolves every input file against the search path.  All failures are
    /// collected so the user sees the complete list at once.
    pub fn resolve_files(
        &self,
        search_path: &[PathBuf],
    ) -> Result<BTreeMap<String, PathBuf>, RundeckError> {
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();
        for (label, name) in &self.files {
            match pathutil::search_file(Path::new(name), search_path) {
                Some(path) => {
                    resolved.insert(label.clone(), path);
                }
                None => missing.push(format!("{label}={name}")),
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(RundeckError::UnresolvedFiles(missing))
        }
    }

    /// Flattens the rundeck into `<run>/I` and refreshes the data-file
    /// symlinks.  `resolved` comes from [`Rundeck::resolve_files`].
    pub fn write_control(
        &self,
        run: &Path,
        resolved: &BTreeMap<String, PathBuf>,
    ) -> Result<(), RundeckError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| RundeckError::Io { path, source }
        };

        fs::create_dir_all(run).map_err(io_err(run))?;

        // refresh data-file symlinks
        for (label, target) in resolved {
            let link = run.join(label);
            match fs::remove_file(&link) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(RundeckError::Io { path: link, source }),
            }
            std::os::unix::fs::symlink(target, &link).map_err(io_err(&link))?;
        }

        let path = run.join(CONTROL_FILE);
        let mut text = String::new();
        text.push_str(self.preamble.first().map(String::as_str).unwrap_or(""));
        text.push('\n');

        text.push_str("&&PARAMETERS\n");
        for (key, value) in &self.params {
            text.push_str(&format!(" {key}={value}\n"));
        }
        for (label, target) in resolved {
            text.push_str(&format!(" _file_{label}='{}'\n", target.display()));
        }
        text.push_str("&&END_PARAMETERS\n");

        text.push_str("\n&INPUTZ\n");
        write_namelist(&mut text, &self.inputz)?;
        text.push_str("/\n");

        text.push_str("\n&INPUTZ_cold\n");
        write_namelist(&mut text, &self.inputz_cold)?;
        text.push_str("/\n");

        debug!("writing control file {}", path.display());
        let mut file = fs::File::create(&path).map_err(io_err(&path))?;
        file.write_all(text.as_bytes()).map_err(io_err(&path))?;
        Ok(())
    }
}

/// Reads back the last control file as-is.  Relaunches reuse it verbatim so
/// the model restarts with exactly the parameters of the interrupted run.
pub fn read_control(run: &Path) -> Result<String, RundeckError> {
    let path = run.join(CONTROL_FILE);
    fs::read_to_string(&path).map_err(|source| RundeckError::Io { path, source })
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn parse_ts(key: &str, value: &str) -> Result<NaiveDateTime, RundeckError> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").map_err(|_| {
        RundeckError::BadTimestamp {
            key: key.to_string(),
            value: value.to_string(),
        }
    })
}

/// The model reads times as `YEARx=,MONTHx=,DATEx=,HOURx=` namelist entries.
fn namelist_time(suffix: char, ts: NaiveDateTime) -> String {
    use chrono::Datelike;
    format!(
        "YEAR{suffix}={},MONTH{suffix}={},DATE{suffix}={},HOUR{suffix}={},",
        ts.year(),
        ts.month(),
        ts.day(),
        ts.hour()
    )
}

fn write_namelist(
    out: &mut String,
    entries: &BTreeMap<String, String>,
) -> Result<(), RundeckError> {
    for (key, value) in entries {
        match key.as_str() {
            "START_TIME" => {
                out.push_str(&namelist_time('I', parse_ts(key, value)?));
                out.push('\n');
            }
            "END_TIME" => {
                out.push_str(&namelist_time('E', parse_ts(key, value)?));
                out.push('\n');
            }
            _ => out.push_str(&format!("{key}={value},\n")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod rundeck_test;
