use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stowpack_core::{BackupStore, Package, Status};

pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = ".state.json.lock";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PackageState {
    status: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    latest_status_changes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relevant_backup: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateData {
    #[serde(default)]
    packages: BTreeMap<String, PackageState>,
}

/// Persistent record of what the user has installed: `state.json` plus the
/// per-package backup archives, all under one state directory. A simple
/// indicator lock file guards against concurrent runs.
///
/// Interior mutability lets the engine record status changes through shared
/// references while the package factory also holds the store.
#[derive(Debug)]
pub struct UserState {
    state_dir: PathBuf,
    state_file: PathBuf,
    lock_file: PathBuf,
    data: RefCell<StateData>,
    uncommitted_archives: RefCell<BTreeMap<String, PathBuf>>,
    closed: Cell<bool>,
}

impl UserState {
    /// Open (creating if necessary) the state under `state_dir` and take the
    /// run lock. Fails if another run holds the lock or the state file is
    /// corrupt; no lock is left behind in either case.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        let state_file = state_dir.join(STATE_FILE);
        let lock_file = state_dir.join(LOCK_FILE);

        std::fs::create_dir_all(&state_dir).with_context(|| {
            format!("could not create state directory '{}'", state_dir.display())
        })?;

        if lock_file.exists() {
            let holder = std::fs::read_to_string(&lock_file).unwrap_or_default();
            bail!(
                "the configuration state is locked by {}; remove '{}' if no \
                 other instance is running",
                holder.lines().next().unwrap_or("<unknown>"),
                lock_file.display()
            );
        }

        let data = match std::fs::read_to_string(&state_file) {
            Ok(raw) => serde_json::from_str(&raw).with_context(|| {
                format!("user state file '{}' is corrupt", state_file.display())
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let data = StateData::default();
                std::fs::write(&state_file, serde_json::to_string(&data)?).with_context(|| {
                    format!("could not create state file '{}'", state_file.display())
                })?;
                data
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("could not read state file '{}'", state_file.display())
                })
            }
        };

        std::fs::write(&lock_file, format!(".pid: {}\n", std::process::id()))
            .with_context(|| format!("could not take lock '{}'", lock_file.display()))?;

        Ok(Self {
            state_dir,
            state_file,
            lock_file,
            data: RefCell::new(data),
            uncommitted_archives: RefCell::new(BTreeMap::new()),
            closed: Cell::new(false),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Persisted status of a package; unknown packages are not installed.
    pub fn status_of(&self, name: &str) -> Status {
        self.data
            .borrow()
            .packages
            .get(name)
            .and_then(|state| Status::parse(&state.status))
            .unwrap_or(Status::NotInstalled)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.status_of(name) == Status::Installed
    }

    /// Names of every package the state has marked installed, sorted.
    pub fn installed_packages(&self) -> Vec<String> {
        self.data
            .borrow()
            .packages
            .iter()
            .filter(|(_, state)| state.status == Status::Installed.as_str())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Record the package's current status, stamping the transition time and
    /// tying the entry to the archive written during this run, if any.
    pub fn save_status(&self, package: &Package) {
        let mut data = self.data.borrow_mut();
        let entry = data.packages.entry(package.name().to_string()).or_default();
        entry.status = package.status().as_str().to_string();
        entry.latest_status_changes.insert(
            package.status().as_str().to_string(),
            Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        );

        entry.relevant_backup = self
            .uncommitted_archives
            .borrow()
            .get(package.name())
            .and_then(|path| path.file_name())
            .map(|file_name| file_name.to_string_lossy().into_owned());
    }

    /// Flush the state to disk and release the lock.
    pub fn close(&self) -> Result<()> {
        self.closed.set(true);
        let raw = serde_json::to_string(&*self.data.borrow())?;
        std::fs::write(&self.state_file, raw).with_context(|| {
            format!("could not write state file '{}'", self.state_file.display())
        })?;
        match std::fs::remove_file(&self.lock_file) {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error)
                .with_context(|| format!("could not release lock '{}'", self.lock_file.display())),
            _ => Ok(()),
        }
    }
}

impl Drop for UserState {
    fn drop(&mut self) {
        if !self.closed.get() {
            if let Err(error) = self.close() {
                warn!(%error, "failed to flush user state on shutdown");
            }
        }
    }
}

impl BackupStore for UserState {
    fn package_archive_path(&self, name: &str) -> Result<PathBuf> {
        if self.is_installed(name) {
            let data = self.data.borrow();
            let backup = data
                .packages
                .get(name)
                .and_then(|state| state.relevant_backup.clone())
                .ok_or_else(|| {
                    anyhow!("no backup archive recorded for installed package '{name}'")
                })?;
            return Ok(self.state_dir.join(backup));
        }

        let mut uncommitted = self.uncommitted_archives.borrow_mut();
        if let Some(path) = uncommitted.get(name) {
            return Ok(path.clone());
        }

        info!(package = %name, "creating package archive");
        let stamp = Local::now().timestamp();
        let mut counter = 0u32;
        let mut path = self.state_dir.join(format!("{name}_{stamp}_{counter}.zip"));
        // A quick rerun could otherwise append into a previous run's archive.
        while path.is_file() {
            counter += 1;
            path = self.state_dir.join(format!("{name}_{stamp}_{counter}.zip"));
        }

        uncommitted.insert(name.to_string(), path.clone());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use stowpack_core::{BackupStore, Descriptor, NullLoader, Package, Status};

    use super::UserState;

    fn package(name: &str, status: Status) -> Package {
        Package::new(
            "default",
            "/srv/packages",
            name,
            format!("/srv/packages/{name}/package.yaml"),
            Descriptor::from_yaml_str("").expect("empty descriptor must parse"),
            status,
            Box::new(NullLoader),
        )
        .expect("package must build")
    }

    #[test]
    fn state_round_trips_through_close() {
        let dir = tempfile::tempdir().expect("must create temp dir");

        let state = UserState::open(dir.path()).expect("must open");
        state.save_status(&package("editors.vim", Status::Installed));
        state.close().expect("must close");

        let state = UserState::open(dir.path()).expect("must reopen");
        assert!(state.is_installed("editors.vim"));
        assert_eq!(state.installed_packages(), vec!["editors.vim"]);
        state.close().expect("must close again");
    }

    #[test]
    fn second_opener_hits_the_lock() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let _state = UserState::open(dir.path()).expect("must open");

        let err = UserState::open(dir.path()).expect_err("locked state must refuse");
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        {
            let _state = UserState::open(dir.path()).expect("must open");
        }
        UserState::open(dir.path()).expect("lock must be gone after drop");
    }

    #[test]
    fn corrupt_state_is_fatal_and_leaves_no_lock() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        std::fs::write(dir.path().join(super::STATE_FILE), "{not json")
            .expect("must write corrupt state");

        let err = UserState::open(dir.path()).expect_err("corrupt state must refuse");
        assert!(err.to_string().contains("corrupt"));
        assert!(!dir.path().join(super::LOCK_FILE).exists());
    }

    #[test]
    fn archive_paths_are_allocated_once_per_run() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let state = UserState::open(dir.path()).expect("must open");

        let first = state
            .package_archive_path("editors.vim")
            .expect("must allocate");
        let second = state
            .package_archive_path("editors.vim")
            .expect("must reuse");
        assert_eq!(first, second);
        let file_name = first
            .file_name()
            .expect("archive path must have a file name")
            .to_string_lossy()
            .into_owned();
        assert!(file_name.starts_with("editors.vim_"));
        assert!(file_name.ends_with("_0.zip"));
    }

    #[test]
    fn installed_packages_resolve_to_their_recorded_backup() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let state = UserState::open(dir.path()).expect("must open");

        let archive = state
            .package_archive_path("shell.zsh")
            .expect("must allocate");
        let installed = package("shell.zsh", Status::Installed);
        state.save_status(&installed);

        let resolved = state
            .package_archive_path("shell.zsh")
            .expect("must resolve recorded backup");
        assert_eq!(resolved, archive);
    }
}
