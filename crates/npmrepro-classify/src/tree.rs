use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use npmrepro_registry::archive::extract_tgz;

/// Descends into the single top-level directory of an extracted package.
///
/// Package archives always wrap their content in one directory (`package/` for npm,
/// anything for other tools). A tree without that wrapper is returned unchanged.
pub fn strip_top_level(dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        bail!("not a directory: {}", dir.display());
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
        entries.push(entry?.path());
    }
    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(dir.to_path_buf()),
    }
}

/// Turns either a `.tgz` archive or an already-extracted directory into a comparable root.
///
/// Archives are extracted into `scratch` (which is cleared first).
pub fn comparable_root(input: &Path, scratch: &Path) -> Result<PathBuf> {
    if input.is_dir() {
        return strip_top_level(input);
    }
    if !input.is_file() {
        bail!("no such archive or directory: {}", input.display());
    }
    if scratch.exists() {
        std::fs::remove_dir_all(scratch)
            .with_context(|| format!("remove {}", scratch.display()))?;
    }
    extract_tgz(input, scratch)?;
    strip_top_level(scratch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_whatever_the_wrapper_is_called() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("node/lib")).unwrap();
        assert_eq!(strip_top_level(tmp.path()).unwrap(), tmp.path().join("node"));
    }

    #[test]
    fn leaves_unwrapped_trees_alone() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("lib")).unwrap();
        std::fs::write(tmp.path().join("package.json"), b"{}").unwrap();
        assert_eq!(strip_top_level(tmp.path()).unwrap(), tmp.path());
    }
}
