use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;
use walkdir::WalkDir;

use stowpack_core::names;

use crate::sources::SourceMap;

/// A package descriptor found under a configured source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPackage {
    pub root: String,
    pub root_path: PathBuf,
    pub name: String,
    pub datafile: PathBuf,
}

/// Logical package-name tree used to decide cross-root shadowing.
#[derive(Debug, Default)]
struct NameTree {
    registered: BTreeSet<String>,
}

impl NameTree {
    fn register(&mut self, name: &str) {
        self.registered.insert(name.to_string());
    }

    fn is_registered(&self, name: &str) -> bool {
        self.registered.contains(name)
    }

    /// Whether any proper prefix of `name` is itself a registered package,
    /// as opposed to a pure namespace level.
    fn has_registered_ancestor(&self, name: &str) -> bool {
        let mut prefix = names::parent_name(name);
        while !prefix.is_empty() {
            if self.registered.contains(&prefix) {
                return true;
            }
            prefix = names::parent_name(&prefix);
        }
        false
    }
}

/// Walk the source roots in priority order and list every visible package.
///
/// A later root must neither override a package an earlier root already
/// provides, nor graft new subpackages into a tree an earlier root owns, so
/// a name is skipped when it or any ancestor is already registered by a
/// previous root.
pub fn discover_packages(roots: &SourceMap) -> Result<Vec<DiscoveredPackage>> {
    let mut seen_in_earlier_roots = NameTree::default();
    let mut discovered = Vec::new();

    for (root, root_path) in roots {
        let mut seen_in_current_root = NameTree::default();

        for entry in WalkDir::new(root_path)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    debug!(root = %root, %error, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file()
                || entry.file_name() != names::DESCRIPTOR_FILE
            {
                continue;
            }

            let name = names::descriptor_path_to_name(root_path, entry.path())?;
            if seen_in_earlier_roots.is_registered(&name)
                || seen_in_earlier_roots.has_registered_ancestor(&name)
            {
                debug!(package = %name, root = %root, "shadowed by an earlier source root");
                continue;
            }

            seen_in_current_root.register(&name);
            discovered.push(DiscoveredPackage {
                root: root.clone(),
                root_path: root_path.clone(),
                name,
                datafile: entry.path().to_path_buf(),
            });
        }

        for name in &seen_in_current_root.registered {
            seen_in_earlier_roots.register(name);
        }
    }

    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::discover_packages;
    use crate::sources::SourceMap;

    fn plant(root: &Path, name: &str) {
        let mut dir = root.to_path_buf();
        for part in name.split('.') {
            dir.push(part);
        }
        std::fs::create_dir_all(&dir).expect("must create package dir");
        std::fs::write(dir.join("package.yaml"), "").expect("must write descriptor");
    }

    #[test]
    fn finds_packages_under_a_root() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        plant(dir.path(), "editors");
        plant(dir.path(), "editors.vim");
        plant(dir.path(), "shell.zsh");

        let roots: SourceMap = vec![("mine".to_string(), dir.path().to_path_buf())];
        let found = discover_packages(&roots).expect("must discover");
        let names: Vec<&str> = found.iter().map(|pkg| pkg.name.as_str()).collect();
        assert_eq!(names, vec!["editors", "editors.vim", "shell.zsh"]);
    }

    #[test]
    fn earlier_roots_shadow_same_names() {
        let high = tempfile::tempdir().expect("must create temp dir");
        let low = tempfile::tempdir().expect("must create temp dir");
        plant(high.path(), "editors.vim");
        plant(low.path(), "editors.vim");
        plant(low.path(), "shell.zsh");

        let roots: SourceMap = vec![
            ("high".to_string(), high.path().to_path_buf()),
            ("low".to_string(), low.path().to_path_buf()),
        ];
        let found = discover_packages(&roots).expect("must discover");

        let vim: Vec<&str> = found
            .iter()
            .filter(|pkg| pkg.name == "editors.vim")
            .map(|pkg| pkg.root.as_str())
            .collect();
        assert_eq!(vim, vec!["high"]);
        assert!(found.iter().any(|pkg| pkg.name == "shell.zsh"));
    }

    #[test]
    fn later_roots_cannot_extend_an_owned_tree() {
        let high = tempfile::tempdir().expect("must create temp dir");
        let low = tempfile::tempdir().expect("must create temp dir");
        plant(high.path(), "editors.vim");
        plant(low.path(), "editors.vim.plugins");

        let roots: SourceMap = vec![
            ("high".to_string(), high.path().to_path_buf()),
            ("low".to_string(), low.path().to_path_buf()),
        ];
        let found = discover_packages(&roots).expect("must discover");
        assert!(!found.iter().any(|pkg| pkg.name == "editors.vim.plugins"));
    }

    #[test]
    fn namespace_levels_do_not_shadow() {
        // "editors" is only a directory in the first root, not a package, so
        // a second root may still provide packages under it.
        let high = tempfile::tempdir().expect("must create temp dir");
        let low = tempfile::tempdir().expect("must create temp dir");
        plant(high.path(), "editors.vim");
        plant(low.path(), "editors.emacs");

        let roots: SourceMap = vec![
            ("high".to_string(), high.path().to_path_buf()),
            ("low".to_string(), low.path().to_path_buf()),
        ];
        let found = discover_packages(&roots).expect("must discover");
        assert!(found.iter().any(|pkg| pkg.name == "editors.emacs"));
    }
}
