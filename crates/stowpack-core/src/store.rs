use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::package::Package;

/// Builds a `Package` for a known name on first access.
pub type PackageFactory = Box<dyn Fn(&str) -> Result<Package>>;

/// Lazy map of every package name discovered for the run. Packages are
/// constructed (descriptor parsed, persisted status applied) only when a
/// caller first asks for them.
pub struct PackageStore {
    factory: PackageFactory,
    entries: BTreeMap<String, Option<Package>>,
}

impl PackageStore {
    pub fn new(factory: PackageFactory, names: impl IntoIterator<Item = String>) -> Self {
        Self {
            factory,
            entries: names.into_iter().map(|name| (name, None)).collect(),
        }
    }

    /// Every known package name, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch a package, constructing it on first access. Asking for a name
    /// that was never discovered is an error.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Package> {
        let slot = self
            .entries
            .get_mut(name)
            .ok_or_else(|| anyhow!("package '{name}' was not found"))?;

        if slot.is_none() {
            *slot = Some((self.factory)(name)?);
        }

        Ok(slot.as_mut().expect("slot was just filled"))
    }

    /// Iterate over every package, constructing any not yet loaded.
    pub fn load_all(&mut self) -> Result<Vec<&Package>> {
        let names = self.names();
        for name in &names {
            self.get_mut(name)?;
        }
        Ok(self
            .entries
            .values()
            .filter_map(|slot| slot.as_ref())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::PackageStore;
    use crate::descriptor::Descriptor;
    use crate::package::{NullLoader, Package};
    use crate::status::Status;

    fn store_with(names: &[&str]) -> (PackageStore, Rc<Cell<usize>>) {
        let builds = Rc::new(Cell::new(0));
        let counter = Rc::clone(&builds);
        let factory = Box::new(move |name: &str| {
            counter.set(counter.get() + 1);
            Package::new(
                "default",
                "/srv/packages",
                name,
                format!("/srv/packages/{}/package.yaml", name.replace('.', "/")),
                Descriptor::from_yaml_str("")?,
                Status::NotInstalled,
                Box::new(NullLoader),
            )
        });
        let store = PackageStore::new(factory, names.iter().map(|name| name.to_string()));
        (store, builds)
    }

    #[test]
    fn packages_are_built_once_on_first_access() {
        let (mut store, builds) = store_with(&["editors.vim", "shell.zsh"]);
        assert_eq!(builds.get(), 0);

        store.get_mut("editors.vim").expect("must build");
        store.get_mut("editors.vim").expect("must reuse");
        assert_eq!(builds.get(), 1);
    }

    #[test]
    fn unknown_name_is_an_error() {
        let (mut store, _builds) = store_with(&["editors.vim"]);
        let err = store
            .get_mut("no.such.package")
            .expect_err("unknown package must error");
        assert!(err.to_string().contains("was not found"));
    }

    #[test]
    fn names_are_sorted() {
        let (store, _builds) = store_with(&["shell.zsh", "editors.vim"]);
        assert_eq!(store.names(), vec!["editors.vim", "shell.zsh"]);
    }
}
