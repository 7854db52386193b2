use crate::pathutil;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const CONFIG_FILE: &str = "simctl.conf";
pub const STATE_DIR: &str = "simctl";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("no {CONFIG_FILE} found above {0}, and the run is not linked into a known root")]
    RootNotFound(PathBuf),
    #[error("failed to read {path}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}")]
    Unparseable {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to create state directory {path}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Settings read from `simctl.conf` at the project root.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// files that must exist under a package dir for it to count as built
    #[serde(default = "default_required_artifacts")]
    pub required_artifacts: Vec<PathBuf>,

    /// directories searched when resolving input data files
    #[serde(default)]
    pub file_path: Vec<PathBuf>,

    #[serde(default)]
    pub slurm: SlurmSettings,

    // parameter hooks for site-specific build setups
    #[serde(default)]
    pub build: BTreeMap<String, serde_yaml::Value>,
}

// a missing or empty simctl.conf must behave like one that spells out the
// defaults; the serde attributes only apply while deserializing
impl Default for Settings {
    fn default() -> Self {
        Self {
            required_artifacts: default_required_artifacts(),
            file_path: Vec::new(),
            slurm: SlurmSettings::default(),
            build: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct SlurmSettings {
    pub account: Option<String>,
}

fn default_required_artifacts() -> Vec<PathBuf> {
    vec![
        PathBuf::from("bin/modelexe"),
        PathBuf::from("lib/libmodele.so"),
    ]
}

/// A resolved project root plus the shared directories hanging off it.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    /// where new run directories go by default
    pub runs: PathBuf,
    pub builds: PathBuf,
    pub pkgs: PathBuf,
    pub keepalive: PathBuf,
    pub settings: Settings,
    pub file_path: PathBuf,
}

impl Config {
    /// Loads the config anchored at an explicit root.
    pub fn at_root(root: &Path) -> Result<Self, ConfigErrors> {
        let file_path = root.join(CONFIG_FILE);
        let settings = if file_path.is_file() {
            let text =
                std::fs::read_to_string(&file_path).map_err(|source| ConfigErrors::Unreadable {
                    path: file_path.clone(),
                    source,
                })?;
            if text.trim().is_empty() {
                Settings::default()
            } else {
                serde_yaml::from_str(&text).map_err(|source| ConfigErrors::Unparseable {
                    path: file_path.clone(),
                    source,
                })?
            }
        } else {
            Settings::default()
        };

        let state = root.join(STATE_DIR);
        std::fs::create_dir_all(&state).map_err(|source| ConfigErrors::StateDir {
            path: state.clone(),
            source,
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            runs: root.to_path_buf(),
            builds: state.join("builds"),
            pkgs: state.join("pkgs"),
            keepalive: state.join("keepalive.txt"),
            settings,
            file_path,
        })
    }

    /// Finds the root for a run directory.
    ///
    /// An explicit `--root` wins.  Otherwise walk up from the run looking
    /// for `simctl.conf`; failing that, a run that was already set up
    /// carries `build`/`pkg` links whose targets live under the state
    /// directory of some root, so follow those.
    pub fn for_run(explicit: Option<&Path>, run: &Path) -> Result<Self, ConfigErrors> {
        if let Some(root) = explicit {
            return Self::at_root(root);
        }
        if let Some(found) = pathutil::search_up(run, |dir| pathutil::has_file(dir, CONFIG_FILE)) {
            debug!("found {CONFIG_FILE} at {}", found.display());
            // unwrap is fine, has_file only yields paths with a parent
            return Self::at_root(found.parent().unwrap());
        }
        for link in ["build", "pkg"] {
            if let Some(target) = pathutil::follow_link(&run.join(link)) {
                // <root>/simctl/{builds,pkgs}/<hash>
                if let Some(root) = target.parent().and_then(Path::parent).and_then(Path::parent) {
                    if root.join(CONFIG_FILE).is_file() || root.join(STATE_DIR).is_dir() {
                        debug!("derived root {} from {link} link", root.display());
                        return Self::at_root(root);
                    }
                }
            }
        }
        Err(ConfigErrors::RootNotFound(run.to_path_buf()))
    }
}
