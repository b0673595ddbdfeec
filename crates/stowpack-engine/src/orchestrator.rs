//! Drives a whole install or uninstall queue. One package failing does not
//! abort the run: its dependents are cascaded to failed and everything else
//! proceeds. The caller receives a per-package report at the end.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{info, warn};

use stowpack_core::{Package, PackageStore};

use crate::archive;
use crate::lifecycle::StageRunner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Installed,
    Uninstalled,
    /// The package's own steps failed.
    Failed(String),
    /// A dependency failed earlier in the run; the package was not attempted.
    DependencyFailed(String),
    WouldInstall,
    WouldUninstall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    pub name: String,
    pub outcome: Outcome,
}

impl PackageReport {
    fn new(name: &str, outcome: Outcome) -> Self {
        Self {
            name: name.to_string(),
            outcome,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Failed(_) | Outcome::DependencyFailed(_)
        )
    }
}

pub struct Orchestrator<'a> {
    runner: StageRunner<'a>,
    dry_run: bool,
    precluded: BTreeMap<String, String>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(runner: StageRunner<'a>, dry_run: bool) -> Self {
        Self {
            runner,
            dry_run,
            precluded: BTreeMap::new(),
        }
    }

    /// Mark a package as not to be attempted in this run. Its report carries
    /// the given reason instead of a status-machine error, and its dependents
    /// cascade as usual.
    pub fn preclude(&mut self, name: &str, reason: &str) {
        self.precluded.insert(name.to_string(), reason.to_string());
    }

    /// Find a dependency of the package that already failed in this run.
    fn failed_dependency(store: &mut PackageStore, name: &str) -> Result<Option<String>> {
        let dependencies = store.get_mut(name)?.dependencies();
        for dependency in dependencies {
            if store.contains(&dependency) && store.get_mut(&dependency)?.is_failed() {
                return Ok(Some(dependency));
            }
        }
        Ok(None)
    }

    /// Install every package in the queue, in order. `persist` is called for
    /// each package whose new status should be saved to the user's state.
    pub fn install_packages(
        &mut self,
        store: &mut PackageStore,
        queue: &[String],
        mut persist: impl FnMut(&Package) -> Result<()>,
    ) -> Result<Vec<PackageReport>> {
        let mut reports = Vec::with_capacity(queue.len());
        for name in queue {
            if let Some(reason) = self.precluded.get(name.as_str()) {
                reports.push(PackageReport::new(name, Outcome::Failed(reason.clone())));
                continue;
            }

            if let Some(dependency) = Self::failed_dependency(store, name)? {
                warn!(
                    package = %name,
                    %dependency,
                    "skipping: a dependency failed to install"
                );
                store.get_mut(name)?.set_failed();
                reports.push(PackageReport::new(name, Outcome::DependencyFailed(dependency)));
                continue;
            }

            if self.dry_run {
                info!(package = %name, "would install");
                reports.push(PackageReport::new(name, Outcome::WouldInstall));
                continue;
            }

            match self.install_one(store, name, &mut persist) {
                Ok(()) => reports.push(PackageReport::new(name, Outcome::Installed)),
                Err(error) => {
                    warn!(package = %name, "failed to install: {error:#}");
                    store.get_mut(name)?.set_failed();
                    reports.push(PackageReport::new(name, Outcome::Failed(format!("{error:#}"))));
                }
            }
        }
        Ok(reports)
    }

    fn install_one(
        &mut self,
        store: &mut PackageStore,
        name: &str,
        persist: &mut impl FnMut(&Package) -> Result<()>,
    ) -> Result<()> {
        let package = store.get_mut(name)?;
        package.select()?;

        self.runner
            .prepare(package)
            .with_context(|| format!("failed to prepare '{name}' for installation"))?;
        self.runner.install(package)?;

        // Snapshot resources and the descriptor, generated uninstall steps
        // included, so uninstalling works without the source checkout.
        let archive_path = self.runner.archive_path(name)?;
        archive::save_package_archive(package, &archive_path)
            .with_context(|| format!("failed to save the snapshot of '{name}'"))?;

        if package.is_installed() && !package.is_support() {
            persist(package)?;
        }
        Ok(())
    }

    /// Uninstall every package in the queue, in order.
    pub fn uninstall_packages(
        &mut self,
        store: &mut PackageStore,
        queue: &[String],
        mut persist: impl FnMut(&Package) -> Result<()>,
    ) -> Result<Vec<PackageReport>> {
        let mut reports = Vec::with_capacity(queue.len());
        for name in queue {
            if let Some(reason) = self.precluded.get(name.as_str()) {
                reports.push(PackageReport::new(name, Outcome::Failed(reason.clone())));
                continue;
            }

            if self.dry_run {
                info!(package = %name, "would uninstall");
                reports.push(PackageReport::new(name, Outcome::WouldUninstall));
                continue;
            }

            match self.uninstall_one(store, name, &mut persist) {
                Ok(()) => reports.push(PackageReport::new(name, Outcome::Uninstalled)),
                Err(error) => {
                    warn!(package = %name, "failed to uninstall: {error:#}");
                    store.get_mut(name)?.set_failed();
                    reports.push(PackageReport::new(name, Outcome::Failed(format!("{error:#}"))));
                }
            }
        }
        Ok(reports)
    }

    fn uninstall_one(
        &mut self,
        store: &mut PackageStore,
        name: &str,
        persist: &mut impl FnMut(&Package) -> Result<()>,
    ) -> Result<()> {
        let package = store.get_mut(name)?;
        if !package.descriptor().has_uninstall_steps() {
            info!(package = %name, "no uninstall actions, nothing to execute");
        }

        self.runner.uninstall(package)?;
        if !package.is_installed() {
            persist(package)?;
        }
        Ok(())
    }
}
