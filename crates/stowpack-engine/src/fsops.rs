//! Small path and filesystem helpers shared by the stage executors. The
//! string-based helpers mirror how descriptor arguments are handled: paths
//! stay strings until the last moment so unexpanded `$VAR` segments survive
//! into the generated uninstall records.

use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

/// `basename` of a string path.
pub(crate) fn basename_str(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

/// Split a string path into `(directory, file name)`, like the tail split of
/// a path: `"a/b" -> ("a", "b")`, `"/a" -> ("/", "a")`, `"a" -> ("", "a")`.
pub(crate) fn split_str(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(index) => (&path[..index], &path[index + 1..]),
        None => ("", path),
    }
}

/// Join two string paths; an absolute `name` replaces `dir` entirely.
pub(crate) fn join_str(dir: &str, name: &str) -> String {
    if dir.is_empty() || name.starts_with('/') {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Lexically normalize a relative path, refusing absolute paths, traversals
/// that escape upward, and the empty path.
pub(crate) fn normalize_relative(path: &str) -> Result<PathBuf> {
    let path = Path::new(path);
    if path.is_absolute() {
        bail!("specifying a path outside the resource directory is forbidden");
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    bail!("specifying a path outside the resource directory is forbidden");
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("specifying a path outside the resource directory is forbidden");
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        bail!("copying the entire resource directory is forbidden");
    }
    Ok(normalized)
}

/// Path of `target` relative to the directory `base`. Both must be absolute.
pub(crate) fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target_parts: Vec<Component<'_>> = target.components().collect();
    let base_parts: Vec<Component<'_>> = base.components().collect();

    let common = target_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

/// Copy a directory tree. The destination directory is created; existing
/// files under it are overwritten.
pub(crate) fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("could not create directory '{}'", dest.display()))?;

    for entry in std::fs::read_dir(source)
        .with_context(|| format!("could not read directory '{}'", source.display()))?
    {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let points_to = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(points_to, &target)
                .with_context(|| format!("could not recreate link '{}'", target.display()))?;
        } else {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "could not copy '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// File name of a path, as a string; errors for paths like `..`.
pub(crate) fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("path '{}' has no file name", path.display()))
}
