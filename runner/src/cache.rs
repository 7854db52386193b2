//! Shared build and package directories, keyed by content hashes, plus
//! their garbage collection.

use crate::{
    config::Config,
    hash,
    pathutil,
    rundeck::Rundeck,
    rundir,
};
use chrono::{Duration, Local, NaiveDate};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("i/o error under {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to walk source tree")]
    Walk(#[from] ignore::Error),
    #[error("cannot hash the build spec")]
    Spec(#[from] serde_yaml::Error),
    #[error("{src} does not look like a model source tree (no {missing})")]
    NotASourceTree { src: PathBuf, missing: String },
    #[error("{stage} failed with {status} in {dir}")]
    BuildFailed {
        stage: String,
        status: String,
        dir: PathBuf,
    },
    #[error("build completed but {pkg} still lacks required artifacts")]
    BadPackage { pkg: PathBuf },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError {
    let path = path.to_path_buf();
    move |source| CacheError::Io { path, source }
}

/// Identifies a build directory: the build-relevant rundeck spec plus the
/// identity of the source tree.  Same spec and source, same build dir.
pub fn build_hash(rd: &Rundeck, src: &Path) -> Result<String, CacheError> {
    let mut hasher = Sha256::new();
    let spec = serde_yaml::to_value(&rd.build)?;
    hash::update_value(&mut hasher, &spec);
    hash::update_str(&mut hasher, &src.display().to_string());
    Ok(hash::hexdigest(hasher))
}

/// Identifies a package: the build spec plus the actual content of the
/// tracked source files.  Editing the source changes the package, not the
/// build directory.
pub fn pkg_hash(rd: &Rundeck, src: &Path) -> Result<String, CacheError> {
    let mut hasher = Sha256::new();
    let spec = serde_yaml::to_value(&rd.build)?;
    hash::update_value(&mut hasher, &spec);
    for file in list_src_files(src)? {
        hash::update_file(&mut hasher, &file).map_err(io_err(&file))?;
    }
    Ok(hash::hexdigest(hasher))
}

static EXCLUDES: Lazy<GlobSet> = Lazy::new(|| {
    let mut builder = GlobSetBuilder::new();
    for pattern in [
        ".git",
        ".*",
        "doc",
        "aux",
        "init_cond",
        "tests",
        "pyext",
        "pylib",
        "decks",
        ".DS_Store",
        ".#*",
        "a.out",
        "*.o",
        "spconfig.py",
    ] {
        builder.add(Glob::new(pattern).unwrap());
    }
    builder.build().unwrap()
});

/// Source files that feed the package hash, sorted for stability: the
/// top-level build manifest, then the `model/` and `cmake/` trees minus
/// generated and auxiliary noise.
fn list_src_files(src: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let mut files = Vec::new();

    let pyar = src.join("modele-control.pyar");
    if pyar.exists() {
        files.push(pyar);
    } else {
        let cmake = src.join("CMakeLists.txt");
        if !cmake.exists() {
            return Err(CacheError::NotASourceTree {
                src: src.to_path_buf(),
                missing: "modele-control.pyar or CMakeLists.txt".to_string(),
            });
        }
        files.push(cmake);
    }

    for top in ["model", "cmake"] {
        let dir = src.join(top);
        if !dir.is_dir() {
            continue;
        }
        let walk = WalkBuilder::new(&dir)
            .standard_filters(false)
            .hidden(true)
            // matching directories are pruned with their whole subtree
            .filter_entry(|entry| !EXCLUDES.is_match(Path::new(entry.file_name())))
            .build();
        for entry in walk {
            let entry = entry?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Verifies that a package directory carries everything needed to run.
pub fn good_pkg(pkg: &Path, required: &[PathBuf]) -> bool {
    required.iter().all(|artifact| pkg.join(artifact).is_file())
}

/// `ln -sfn src dst`, relative, and a no-op when the link already points at
/// the target.  Replacement goes through a temporary name so a reader never
/// sees the link missing.
pub fn set_link(src: &Path, dst: &Path) -> Result<(), CacheError> {
    if dst.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
        if let Some(current) = pathutil::follow_link(dst) {
            if current == *src || fs::canonicalize(src).map(|c| c == current).unwrap_or(false) {
                return Ok(());
            }
        }
    }

    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    let rel = pathutil::relative_to(src, parent);
    let tmp = dst.with_extension("lnk.tmp");
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(&tmp)(e)),
    }
    std::os::unix::fs::symlink(&rel, &tmp).map_err(io_err(&tmp))?;
    fs::rename(&tmp, dst).map_err(io_err(dst))?;
    Ok(())
}

/// Configures and builds into `build`, installing into `pkg`.
///
/// The build directory is reused as-is; incremental rebuilds are the whole
/// point of keying it separately from the package.
pub fn ensure_built(
    config: &Config,
    rundeck_path: &Path,
    src: &Path,
    build: &Path,
    pkg: &Path,
    jobs: usize,
) -> Result<(), CacheError> {
    fs::create_dir_all(build).map_err(io_err(build))?;
    fs::create_dir_all(pkg).map_err(io_err(pkg))?;

    let spconfig = src.join("spconfig.py");
    let mut cmd = match read_shebang(&spconfig) {
        Some(interpreter) => {
            // run through the recorded interpreter; the shebang line itself
            // can exceed the kernel's length limit
            let mut c = Command::new(interpreter);
            c.arg(&spconfig);
            c
        }
        None => Command::new(&spconfig),
    };
    cmd.arg(format!("-DRUN={}", rundeck_path.display()))
        .arg(format!("-DCMAKE_INSTALL_PREFIX={}", pkg.display()))
        .arg(src)
        .current_dir(build);

    info!("configuring build in {}", build.display());
    let status = cmd.status().map_err(io_err(&spconfig))?;
    if !status.success() {
        return Err(CacheError::BuildFailed {
            stage: "spconfig.py".to_string(),
            status: status.to_string(),
            dir: build.to_path_buf(),
        });
    }

    info!("make install -j{jobs} in {}", build.display());
    let status = Command::new("make")
        .arg("install")
        .arg(format!("-j{jobs}"))
        .current_dir(build)
        .status()
        .map_err(io_err(build))?;
    if !status.success() {
        return Err(CacheError::BuildFailed {
            stage: "make install".to_string(),
            status: status.to_string(),
            dir: build.to_path_buf(),
        });
    }

    if !good_pkg(pkg, &config.settings.required_artifacts) {
        return Err(CacheError::BadPackage {
            pkg: pkg.to_path_buf(),
        });
    }
    Ok(())
}

fn read_shebang(script: &Path) -> Option<String> {
    let text = fs::read_to_string(script).ok()?;
    let first = text.lines().next()?;
    let interpreter = first.strip_prefix("#!")?.trim();
    if interpreter.is_empty() {
        None
    } else {
        Some(interpreter.to_string())
    }
}

static RM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^rm-(\d{4})(\d{2})(\d{2})-\d+-(.*)").unwrap());

/// Phase 1 of garbage collection: rename every unused directory to
/// `rm-<YYYYMMDD>-<n>-<name>`, recording when it fell out of use.  Already
/// inactivated entries are left alone.
pub fn inactivate_unused(
    dir: &Path,
    used: &BTreeSet<String>,
) -> Result<usize, CacheError> {
    inactivate_unused_on(dir, used, Local::now().date_naive())
}

pub fn inactivate_unused_on(
    dir: &Path,
    used: &BTreeSet<String>,
    today: NaiveDate,
) -> Result<usize, CacheError> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let stamp = today.format("%Y%m%d").to_string();
    let mut count = 0;
    for entry in fs::read_dir(dir).map_err(io_err(dir))?.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        if RM_RE.is_match(&name) || used.contains(&name) || !entry.path().is_dir() {
            continue;
        }
        // pick the first free rm- name for today
        let mut version = 0;
        let new_path = loop {
            let candidate = dir.join(format!("rm-{stamp}-{version}-{name}"));
            if !candidate.exists() {
                break candidate;
            }
            version += 1;
        };
        fs::rename(entry.path(), &new_path).map_err(io_err(&entry.path()))?;
        count += 1;
    }
    Ok(count)
}

/// Phase 2: delete inactivated directories whose recorded date is older
/// than the cutoff.
pub fn delete_inactive(dir: &Path, cutoff: NaiveDate) -> Result<usize, CacheError> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in fs::read_dir(dir).map_err(io_err(dir))?.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(caps) = RM_RE.captures(&name) else {
            continue;
        };
        let date = NaiveDate::from_ymd_opt(
            caps[1].parse().unwrap_or(0),
            caps[2].parse().unwrap_or(0),
            caps[3].parse().unwrap_or(0),
        );
        match date {
            Some(date) if date < cutoff => {
                fs::remove_dir_all(entry.path()).map_err(io_err(&entry.path()))?;
                count += 1;
            }
            Some(_) => {}
            None => warn!("ignoring {name}: bad inactivation date"),
        }
    }
    Ok(count)
}

/// Two-phase garbage collection over builds and packages.  Unused entries
/// are inactivated now and deleted two weeks later, so a purge right after
/// deleting a run cannot destroy something still wanted.  `--force` deletes
/// everything inactive immediately.
pub fn purge(config: &Config, force: bool) -> Result<(), CacheError> {
    let mut runs = Vec::new();
    if let Err(error) = rundir::collect_runs(&config.runs, &mut runs) {
        warn!(error = ?error, "run scan was incomplete");
    }

    let mut used_builds = BTreeSet::new();
    let mut used_pkgs = BTreeSet::new();
    for run in &runs {
        if let Some(build) = pathutil::follow_link(&run.join("build")) {
            if let Some(name) = build.file_name() {
                used_builds.insert(name.to_string_lossy().to_string());
            }
        }
        if let Some(pkg) = pathutil::follow_link(&run.join("pkg")) {
            if let Some(name) = pkg.file_name() {
                used_pkgs.insert(name.to_string_lossy().to_string());
            }
        }
    }

    let today = Local::now().date_naive();
    let cutoff = if force {
        today + Duration::days(1)
    } else {
        today - Duration::days(14)
    };

    let n = inactivate_unused(&config.pkgs, &used_pkgs)?;
    info!("renamed {n} packages, {} remain active", used_pkgs.len());
    let n = delete_inactive(&config.pkgs, cutoff)?;
    info!("deleted {n} packages inactivated before {cutoff}");

    let n = inactivate_unused(&config.builds, &used_builds)?;
    info!("renamed {n} builds, {} remain active", used_builds.len());
    let n = delete_inactive(&config.builds, cutoff)?;
    info!("deleted {n} builds inactivated before {cutoff}");

    Ok(())
}
