//! The command flows: wire the state store, source discovery, resolver and
//! the execution engine together for each CLI command.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::warn;

use stowpack_core::{names, BackupStore, Condition, ConditionStore, Package, PackageStore};
use stowpack_engine::{
    archive, assess_superuser_needs, check_superuser, ConsolePrompt, Orchestrator, PackageReport,
    SessionContext, StageRunner, SudoProbe, TransformerPipeline,
};
use stowpack_resolver::{expand_install_order, expand_uninstall_order};
use stowpack_store::{
    discover_packages, source_list_path, DiscoveredPackage, SourceEntry, SourceList, UserState,
};

use crate::render;

pub struct RunOptions {
    pub source: Option<String>,
    pub dry_run: bool,
    pub literal_copies: bool,
    pub state_dir: Option<PathBuf>,
}

/// Default state directory; overridable with `$STOWPACK_HOME`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("STOWPACK_HOME") {
        return Ok(PathBuf::from(dir));
    }
    let home =
        std::env::var("HOME").context("HOME is not set; pass --state-dir explicitly")?;
    Ok(Path::new(&home).join(".local/share/stowpack"))
}

fn resolve_state_dir(options: &RunOptions) -> Result<PathBuf> {
    match &options.state_dir {
        Some(dir) => Ok(dir.clone()),
        None => default_state_dir(),
    }
}

/// Everything a run needs: the locked user state and the lazy package store
/// spanning both the discovered source trees and the installed archives.
struct Workspace {
    user_state: Rc<UserState>,
    store: PackageStore,
    // Keeps extracted descriptors of installed packages alive for the run.
    _descriptor_scratch: Rc<tempfile::TempDir>,
}

fn open_workspace(options: &RunOptions) -> Result<Workspace> {
    let state_dir = resolve_state_dir(options)?;
    let user_state = Rc::new(UserState::open(&state_dir)?);

    let sources = SourceList::load(source_list_path(&state_dir))?;
    let roots = sources.filter_roots(options.source.as_deref())?;
    let discovered: BTreeMap<String, DiscoveredPackage> = discover_packages(&roots)?
        .into_iter()
        .map(|package| (package.name.clone(), package))
        .collect();

    let mut known: Vec<String> = discovered.keys().cloned().collect();
    for name in user_state.installed_packages() {
        if !discovered.contains_key(&name) {
            known.push(name);
        }
    }

    let scratch = Rc::new(
        tempfile::Builder::new()
            .prefix("stowpack-descriptors-")
            .tempdir()
            .context("could not create the descriptor scratch directory")?,
    );

    let state = Rc::clone(&user_state);
    let descriptor_dirs = Rc::clone(&scratch);
    let factory = Box::new(move |name: &str| {
        // Installed packages come back from their archive, so uninstalling
        // works even when the source checkout is gone.
        if state.is_installed(name) {
            let archive_path = state.package_archive_path(name)?;
            let package_dir = descriptor_dirs.path().join(name);
            std::fs::create_dir_all(&package_dir)?;
            return archive::load_installed_package(name, &archive_path, &package_dir);
        }
        match discovered.get(name) {
            Some(found) => Package::from_descriptor_file(
                found.root.clone(),
                found.root_path.clone(),
                name,
                found.datafile.clone(),
            ),
            None => Err(anyhow!("package '{name}' was not found")),
        }
    });

    Ok(Workspace {
        user_state,
        store: PackageStore::new(factory, known),
        _descriptor_scratch: scratch,
    })
}

/// Names in the reserved support namespace cannot be targeted directly.
fn refuse_support_targets(requested: &[String]) -> Result<()> {
    for name in requested {
        if names::is_support_name(name) {
            bail!(
                "'{}' packages are support packages and cannot be managed directly",
                names::RESERVED_SUPPORT_SEGMENT
            );
        }
    }
    Ok(())
}

/// Glob and validate the requested names against the known packages.
fn resolve_requested(store: &PackageStore, requested: &[String]) -> Result<Vec<String>> {
    let available = store.names();
    let expanded = names::package_glob(&available, requested)?;
    let expanded = names::deduplicate(expanded);
    for name in &expanded {
        if !store.contains(name) {
            bail!("package '{name}' was not found");
        }
    }
    Ok(expanded)
}

/// Report which queued packages need elevation, probe `sudo` once if any
/// package interacts with it, and seed the condition store with the result.
/// When the probe denies, packages requiring elevation are failed up front
/// and returned so their reports name the denial as the cause.
fn prepare_superuser(
    store: &mut PackageStore,
    queue: &[String],
    conditions: &mut ConditionStore,
) -> Result<BTreeSet<String>> {
    let needs = assess_superuser_needs(store, queue)?;
    if needs.is_empty() {
        return Ok(BTreeSet::new());
    }

    if !needs.requires.is_empty() {
        println!("The following packages require superuser access to manage:");
        for name in &needs.requires {
            println!("    {name}");
        }
    }
    if !needs.suggests.is_empty() {
        println!("The following packages can take additional actions with superuser access:");
        for name in &needs.suggests {
            println!("    {name}");
        }
    }

    let granted = check_superuser();
    conditions.update(Condition::Superuser, granted);
    if granted {
        return Ok(BTreeSet::new());
    }
    for name in &needs.requires {
        warn!(package = %name, "superuser access was denied, the package cannot be managed");
        store.get_mut(name)?.set_failed();
    }
    Ok(needs.requires)
}

fn finish(reports: &[PackageReport], user_state: &UserState) -> Result<()> {
    for report in reports {
        println!("{}", render::format_report_line(report, true));
    }
    user_state.close()?;

    let failures = reports.iter().filter(|report| report.is_failure()).count();
    if failures > 0 {
        bail!("{failures} package(s) failed");
    }
    Ok(())
}

pub fn list_packages(options: &RunOptions) -> Result<()> {
    let mut workspace = open_workspace(options)?;

    let mut rows = Vec::new();
    for package in workspace.store.load_all()? {
        if package.is_support() {
            continue;
        }
        rows.push(render::PackageRow {
            source: if package.is_installed() {
                render::INSTALLED_TAG.to_string()
            } else {
                package.root().to_string()
            },
            name: package.name().to_string(),
            description: package.description().unwrap_or_default(),
        });
    }

    for line in render::format_package_table(&rows, true) {
        println!("{line}");
    }
    workspace.user_state.close()
}

pub fn install_packages(options: &RunOptions, requested: &[String]) -> Result<()> {
    refuse_support_targets(requested)?;
    let mut workspace = open_workspace(options)?;

    let requested = resolve_requested(&workspace.store, requested)?;
    let installed = workspace.user_state.installed_packages();
    let queue = expand_install_order(&mut workspace.store, &installed, &requested)?;
    if queue.is_empty() {
        println!("Nothing to do.");
        return workspace.user_state.close();
    }

    let mut conditions = ConditionStore::new(Box::new(SudoProbe));
    let denied = prepare_superuser(&mut workspace.store, &queue, &mut conditions)?;

    let pipeline = TransformerPipeline::new(!options.literal_copies);
    let mut session = SessionContext::new()?;
    let mut prompter = ConsolePrompt;
    let user_state = Rc::clone(&workspace.user_state);
    let runner = StageRunner::new(
        &mut session,
        &mut conditions,
        &pipeline,
        workspace.user_state.as_ref(),
        &mut prompter,
    );

    let mut orchestrator = Orchestrator::new(runner, options.dry_run);
    for name in &denied {
        orchestrator.preclude(name, "superuser access denied");
    }
    let reports = orchestrator.install_packages(&mut workspace.store, &queue, |package| {
        user_state.save_status(package);
        Ok(())
    })?;
    finish(&reports, &workspace.user_state)
}

pub fn uninstall_packages(options: &RunOptions, requested: &[String]) -> Result<()> {
    refuse_support_targets(requested)?;
    let mut workspace = open_workspace(options)?;

    let requested = resolve_requested(&workspace.store, requested)?;
    let installed = workspace.user_state.installed_packages();
    let queue = expand_uninstall_order(&mut workspace.store, &installed, &requested)?;
    if queue.is_empty() {
        println!("Nothing to do.");
        return workspace.user_state.close();
    }

    let mut conditions = ConditionStore::new(Box::new(SudoProbe));
    let denied = prepare_superuser(&mut workspace.store, &queue, &mut conditions)?;

    let pipeline = TransformerPipeline::new(!options.literal_copies);
    let mut session = SessionContext::new()?;
    let mut prompter = ConsolePrompt;
    let user_state = Rc::clone(&workspace.user_state);
    let runner = StageRunner::new(
        &mut session,
        &mut conditions,
        &pipeline,
        workspace.user_state.as_ref(),
        &mut prompter,
    );

    let mut orchestrator = Orchestrator::new(runner, options.dry_run);
    for name in &denied {
        orchestrator.preclude(name, "superuser access denied");
    }
    let reports = orchestrator.uninstall_packages(&mut workspace.store, &queue, |package| {
        user_state.save_status(package);
        Ok(())
    })?;
    finish(&reports, &workspace.user_state)
}

pub fn list_sources(options: &RunOptions) -> Result<()> {
    let state_dir = resolve_state_dir(options)?;
    let sources = SourceList::load(source_list_path(&state_dir))?;
    if sources.entries().is_empty() {
        println!("No sources configured.");
    }
    for entry in sources.entries() {
        println!("{}  {}", entry.name, entry.directory.display());
    }
    Ok(())
}

pub fn add_source(options: &RunOptions, name: &str, directory: &Path) -> Result<()> {
    let state_dir = resolve_state_dir(options)?;
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("could not create state directory '{}'", state_dir.display()))?;

    let mut sources = SourceList::load(source_list_path(&state_dir))?;
    sources.add_source(SourceEntry {
        name: name.to_string(),
        directory: directory.to_path_buf(),
    })?;
    sources.save()
}

pub fn remove_source(options: &RunOptions, name: &str) -> Result<()> {
    let state_dir = resolve_state_dir(options)?;
    let mut sources = SourceList::load(source_list_path(&state_dir))?;
    sources.delete_source(name)?;
    sources.save()
}
