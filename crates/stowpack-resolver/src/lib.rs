use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{bail, Result};
use tracing::info;

use stowpack_core::{names, PackageStore};

/// Logical names of the packages the given package depends on, direct and
/// transitive, direct dependencies first. Names in `ignore` terminate the
/// walk, which also bounds dependency cycles.
///
/// A declared dependency that is not a known package is an error, with one
/// exception: a missing logical parent is tolerated, since intermediate tree
/// levels need not carry a descriptor of their own.
pub fn dependency_closure(
    store: &mut PackageStore,
    name: &str,
    ignore: &[String],
) -> Result<Vec<String>> {
    if ignore.iter().any(|ignored| ignored == name) {
        return Ok(Vec::new());
    }

    let (declared, parent) = {
        let package = store.get_mut(name)?;
        (package.dependencies(), package.parent())
    };
    let declared: BTreeSet<String> = declared.into_iter().collect();

    let mut out = Vec::new();
    for dependency in declared {
        if ignore.iter().any(|ignored| *ignored == dependency) {
            continue;
        }
        if !store.contains(&dependency) {
            if dependency == parent {
                continue;
            }
            bail!("dependency '{dependency}' for '{name}' was not found as a package");
        }

        out.push(dependency.clone());
        let mut nested_ignore = ignore.to_vec();
        nested_ignore.push(name.to_string());
        out.extend(dependency_closure(store, &dependency, &nested_ignore)?);
    }

    Ok(out)
}

/// Expand the user's install request with every unmet dependency, producing
/// the order packages must be handled in. Already-installed packages drop
/// out; asking for a support package directly is an error.
pub fn expand_install_order(
    store: &mut PackageStore,
    installed: &[String],
    requested: &[String],
) -> Result<Vec<String>> {
    let mut queue: VecDeque<String> = requested.iter().cloned().collect();

    for name in requested {
        let package = store.get_mut(name)?;
        if package.is_support() {
            bail!(
                "'{name}' is a support package that is not to be directly \
                 installed, its life is restricted to helping other packages' \
                 installation process"
            );
        }
        if package.is_installed() {
            info!(package = %name, "already installed, skipping");
            queue.retain(|queued| queued != name);
            continue;
        }

        let unmet = dependency_closure(store, name, installed)?;
        if !unmet.is_empty() {
            info!(package = %name, dependencies = ?unmet, "needs dependencies installed first");
            // Prepending one by one reverses the list, so the deepest
            // dependency ends up frontmost.
            for dependency in unmet {
                queue.push_front(dependency);
            }
        }
    }

    Ok(names::deduplicate(queue))
}

/// Expand the user's uninstall request with every installed package that
/// depends on a removed one, dependents ordered before their dependencies.
/// Packages that are not installed drop out; asking for a support package
/// directly is an error.
pub fn expand_uninstall_order(
    store: &mut PackageStore,
    installed: &[String],
    requested: &[String],
) -> Result<Vec<String>> {
    let mut queue: Vec<String> = requested.to_vec();

    for name in requested {
        let package = store.get_mut(name)?;
        if package.is_support() {
            bail!(
                "'{name}' is a support package that is not to be directly \
                 removed, its life is restricted to helping other packages' \
                 installation process"
            );
        }
        if !package.is_installed() {
            info!(package = %name, "not installed, nothing to uninstall");
            queue.retain(|queued| queued != name);
        }
    }

    let mut closures: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for name in installed {
        let closure = dependency_closure(store, name, &[])?;
        closures.insert(name.clone(), closure.into_iter().collect());
    }

    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for name in &queue {
        visit_dependents(name, &closures, &mut visited, &mut out);
    }

    Ok(names::deduplicate(out))
}

/// Post-order walk of the inverted dependency graph: emit every installed
/// dependent of `name` before `name` itself.
fn visit_dependents(
    name: &str,
    closures: &BTreeMap<String, BTreeSet<String>>,
    visited: &mut BTreeSet<String>,
    out: &mut Vec<String>,
) {
    if !visited.insert(name.to_string()) {
        return;
    }

    for (candidate, closure) in closures {
        if candidate != name && closure.contains(name) {
            info!(package = %candidate, dependency = %name, "has a dependency marked for removal");
            visit_dependents(candidate, closures, visited, out);
        }
    }

    out.push(name.to_string());
}

#[cfg(test)]
mod tests {
    use stowpack_core::{Descriptor, NullLoader, Package, PackageStore, Status};

    use crate::{dependency_closure, expand_install_order, expand_uninstall_order};

    fn store_of(entries: &[(&str, &str, Status)]) -> PackageStore {
        let owned: Vec<(String, String, Status)> = entries
            .iter()
            .map(|(name, yaml, status)| (name.to_string(), yaml.to_string(), *status))
            .collect();
        let names: Vec<String> = owned.iter().map(|(name, _, _)| name.clone()).collect();

        let factory = Box::new(move |wanted: &str| {
            let (name, yaml, status) = owned
                .iter()
                .find(|(name, _, _)| name == wanted)
                .expect("factory only sees known names")
                .clone();
            Package::new(
                "default",
                "/srv/packages",
                name.clone(),
                format!("/srv/packages/{}/package.yaml", name.replace('.', "/")),
                Descriptor::from_yaml_str(&yaml)?,
                status,
                Box::new(NullLoader),
            )
        });

        PackageStore::new(factory, names)
    }

    #[test]
    fn closure_lists_direct_dependencies_first() {
        let mut store = store_of(&[
            ("editors", "", Status::NotInstalled),
            (
                "editors.vim",
                "dependencies:\n  - shell.zsh\n",
                Status::NotInstalled,
            ),
            ("shell", "", Status::NotInstalled),
            ("shell.zsh", "", Status::NotInstalled),
        ]);

        let closure =
            dependency_closure(&mut store, "editors.vim", &[]).expect("closure must resolve");
        assert_eq!(closure, vec!["editors", "shell.zsh", "shell"]);
    }

    #[test]
    fn closure_tolerates_missing_parent_only() {
        let mut store = store_of(&[("editors.vim", "", Status::NotInstalled)]);
        let closure =
            dependency_closure(&mut store, "editors.vim", &[]).expect("missing parent tolerated");
        assert!(closure.is_empty());

        let mut store = store_of(&[(
            "editors.vim",
            "depend on parent: false\ndependencies:\n  - no.such\n",
            Status::NotInstalled,
        )]);
        let err = dependency_closure(&mut store, "editors.vim", &[])
            .expect_err("missing real dependency must error");
        assert!(err.to_string().contains("was not found as a package"));
    }

    #[test]
    fn closure_terminates_on_cycles() {
        let mut store = store_of(&[
            (
                "alpha",
                "dependencies:\n  - beta\n",
                Status::NotInstalled,
            ),
            (
                "beta",
                "dependencies:\n  - alpha\n",
                Status::NotInstalled,
            ),
        ]);

        let closure = dependency_closure(&mut store, "alpha", &[]).expect("cycle must terminate");
        assert_eq!(closure, vec!["beta"]);
    }

    #[test]
    fn install_order_prepends_dependencies() {
        let mut store = store_of(&[
            ("editors", "", Status::NotInstalled),
            ("editors.vim", "", Status::NotInstalled),
        ]);

        let order = expand_install_order(&mut store, &[], &["editors.vim".to_string()])
            .expect("order must expand");
        assert_eq!(order, vec!["editors", "editors.vim"]);
    }

    #[test]
    fn install_order_skips_installed_and_met_dependencies() {
        let mut store = store_of(&[
            ("editors", "", Status::Installed),
            ("editors.vim", "", Status::NotInstalled),
            ("shell.zsh", "", Status::Installed),
        ]);
        let installed = vec!["editors".to_string(), "shell.zsh".to_string()];

        let order = expand_install_order(
            &mut store,
            &installed,
            &["editors.vim".to_string(), "shell.zsh".to_string()],
        )
        .expect("order must expand");
        assert_eq!(order, vec!["editors.vim"]);
    }

    #[test]
    fn install_order_rejects_support_packages() {
        let mut store = store_of(&[("helpers", "support: true\n", Status::NotInstalled)]);
        let err = expand_install_order(&mut store, &[], &["helpers".to_string()])
            .expect_err("support package must be rejected");
        assert!(err.to_string().contains("support package"));
    }

    #[test]
    fn uninstall_order_puts_dependents_first() {
        let mut store = store_of(&[
            ("editors", "", Status::Installed),
            ("editors.vim", "", Status::Installed),
            ("editors.vim.plugins", "", Status::Installed),
        ]);
        let installed = vec![
            "editors".to_string(),
            "editors.vim".to_string(),
            "editors.vim.plugins".to_string(),
        ];

        let order = expand_uninstall_order(&mut store, &installed, &["editors".to_string()])
            .expect("order must expand");
        assert_eq!(order, vec!["editors.vim.plugins", "editors.vim", "editors"]);
    }

    #[test]
    fn uninstall_order_drops_not_installed() {
        let mut store = store_of(&[("editors.vim", "", Status::NotInstalled)]);
        let order = expand_uninstall_order(&mut store, &[], &["editors.vim".to_string()])
            .expect("order must expand");
        assert!(order.is_empty());
    }
}
