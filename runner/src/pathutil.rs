use std::path::{Path, PathBuf};

/// Scans up a directory tree until the condition yields something.
pub fn search_up<F>(start: &Path, condition: F) -> Option<PathBuf>
where
    F: Fn(&Path) -> Option<PathBuf>,
{
    let mut path = start.to_path_buf();
    loop {
        if let Some(found) = condition(&path) {
            return Some(found);
        }
        if !path.pop() {
            return None;
        }
    }
}

/// Returns `path/fname` if it exists.
pub fn has_file(path: &Path, fname: &str) -> Option<PathBuf> {
    let candidate = path.join(fname);
    if candidate.exists() {
        Some(candidate)
    } else {
        None
    }
}

/// Resolves a symlink to its (existing) target, or None if the link is
/// absent or dangling.  "No value" for a run association is a missing link.
pub fn follow_link(link: &Path) -> Option<PathBuf> {
    if !link.exists() {
        return None;
    }
    link.canonicalize().ok()
}

/// Given a search path, find a file.
pub fn search_file(fname: &Path, search_path: &[PathBuf]) -> Option<PathBuf> {
    if fname.exists() {
        return fname.canonicalize().ok();
    }
    for dir in search_path {
        let candidate = dir.join(fname);
        if candidate.exists() {
            return candidate.canonicalize().ok();
        }
    }
    None
}

/// Relative path from `base` (a directory) to `target`, for symlink contents.
pub fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target_comps: Vec<_> = target.components().collect();
    let base_comps: Vec<_> = base.components().collect();

    let mut common = 0;
    while common < target_comps.len()
        && common < base_comps.len()
        && target_comps[common] == base_comps[common]
    {
        common += 1;
    }

    let mut rel = PathBuf::new();
    for _ in common..base_comps.len() {
        rel.push("..");
    }
    for comp in &target_comps[common..] {
        rel.push(comp);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

#[cfg(test)]
mod pathutil_test {
    use super::relative_to;
    use std::path::{Path, PathBuf};

    #[test]
    pub fn relative_sibling() {
        assert_eq!(
            relative_to(Path::new("/a/pkgs/xyz"), Path::new("/a/runs/r1")),
            PathBuf::from("../../pkgs/xyz")
        );
    }

    #[test]
    pub fn relative_below() {
        assert_eq!(
            relative_to(Path::new("/a/b/c"), Path::new("/a")),
            PathBuf::from("b/c")
        );
    }

    #[test]
    pub fn relative_same() {
        assert_eq!(
            relative_to(Path::new("/a/b"), Path::new("/a/b")),
            PathBuf::from(".")
        );
    }
}
