use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

pub const DESCRIPTOR_FILE: &str = "package.yaml";

/// Name segment reserved for support package groups.
pub const RESERVED_SUPPORT_SEGMENT: &str = "internal";

const GLOBBERS: [&str; 2] = ["*", "__ALL__"];

/// Convert a logical package name (`editors.vim`) to the descriptor path
/// under the given source root.
pub fn name_to_descriptor_path(root_path: &Path, name: &str) -> PathBuf {
    let mut path = root_path.to_path_buf();
    for part in name.split('.') {
        path.push(part);
    }
    path.join(DESCRIPTOR_FILE)
}

/// Extract the logical package name from a descriptor path under `root_path`.
pub fn descriptor_path_to_name(root_path: &Path, descriptor: &Path) -> Result<String> {
    let package_dir = descriptor
        .parent()
        .ok_or_else(|| anyhow!("descriptor path has no parent: {}", descriptor.display()))?;
    let relative = package_dir.strip_prefix(root_path).map_err(|_| {
        anyhow!(
            "descriptor {} is not under source root {}",
            descriptor.display(),
            root_path.display()
        )
    })?;

    let mut segments = Vec::new();
    for component in relative.components() {
        segments.push(component.as_os_str().to_string_lossy().into_owned());
    }
    Ok(segments.join("."))
}

/// The name of the package that should be the logical parent of `name`.
/// Empty for top-level packages. There is no guarantee the parent exists
/// as an installable package.
pub fn parent_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

pub fn is_support_name(name: &str) -> bool {
    name.split('.').any(|part| part == RESERVED_SUPPORT_SEGMENT)
}

/// Expand `group.*` / `group.__ALL__` globbing expressions over the known
/// package names. Plain names pass through untouched, whether or not known.
pub fn package_glob<'a, I>(available: I, expressions: &[String]) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a String>,
{
    let available: Vec<&String> = available.into_iter().collect();
    let mut out = Vec::new();

    for expression in expressions {
        if !GLOBBERS.iter().any(|glob| expression.ends_with(glob)) {
            out.push(expression.clone());
            continue;
        }

        let Some(prefix) = GLOBBERS
            .iter()
            .find_map(|glob| expression.strip_suffix(&format!(".{glob}")))
        else {
            return Err(anyhow!(
                "specify a tree with a closing '.' before the '*' or '__ALL__': {expression}"
            ));
        };
        if GLOBBERS.iter().any(|glob| prefix.contains(glob)) {
            return Err(anyhow!(
                "do not specify multiple '*'s or '__ALL__'s in the same tree name: {expression}"
            ));
        }

        let mut globbed: Vec<String> = available
            .iter()
            .filter(|name| name.starts_with(prefix))
            .map(|name| name.to_string())
            .collect();
        globbed.sort();
        out.extend(globbed);
    }

    Ok(out)
}

/// Deduplicate keeping the first occurrence of every element.
pub fn deduplicate(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}
