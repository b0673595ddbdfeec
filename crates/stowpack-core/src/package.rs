use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::descriptor::Descriptor;
use crate::names;
use crate::status::{require_status, Status};

/// Strategy for materializing a package's resource files on first use.
/// Disk-backed packages need nothing (`NullLoader`); archive-backed packages
/// extract lazily (the engine supplies that implementation). Fixed once at
/// construction.
pub trait ResourceLoader: fmt::Debug {
    /// Make the package's resource files available under `resource_dir`.
    /// Must be idempotent: a second call is a no-op.
    fn materialize(&mut self, resource_dir: &Path) -> Result<()>;
}

/// Loader for packages whose resources already sit on disk.
#[derive(Debug, Default)]
pub struct NullLoader;

impl ResourceLoader for NullLoader {
    fn materialize(&mut self, _resource_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Access to the per-package backup archives owned by the user-state store.
/// The engine uses this to persist install snapshots and to back up files
/// overwritten by `replace`.
pub trait BackupStore {
    /// Path of the zip archive backing the given package. For packages not
    /// yet installed a fresh archive path is allocated on first request and
    /// returned again on every later request within the run.
    fn package_archive_path(&self, name: &str) -> Result<PathBuf>;
}

/// One package: identity, parsed descriptor, lifecycle status, and the
/// resource-loading strategy it was constructed with.
pub struct Package {
    root: String,
    root_path: PathBuf,
    name: String,
    datafile: PathBuf,
    resource_dir: PathBuf,
    status: Status,
    descriptor: Descriptor,
    loader: Box<dyn ResourceLoader>,
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Package {
    /// Build a package from an already-parsed descriptor. A support package
    /// declaring uninstall steps is a metadata error.
    pub fn new(
        root: impl Into<String>,
        root_path: impl Into<PathBuf>,
        name: impl Into<String>,
        datafile: impl Into<PathBuf>,
        descriptor: Descriptor,
        status: Status,
        loader: Box<dyn ResourceLoader>,
    ) -> Result<Self> {
        let name = name.into();
        let datafile = datafile.into();
        let resource_dir = datafile
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("descriptor path has no parent: {}", datafile.display()))?;

        let package = Self {
            root: root.into(),
            root_path: root_path.into(),
            name,
            datafile,
            resource_dir,
            status,
            descriptor,
            loader,
        };

        if package.is_support() && package.descriptor.has_uninstall_steps() {
            return Err(anyhow!(
                "'{}' descriptor invalid: package marked as a support package \
                 but has an 'uninstall' section",
                package.name
            ));
        }

        Ok(package)
    }

    /// Load a fresh, not-installed package from its on-disk descriptor.
    pub fn from_descriptor_file(
        root: impl Into<String>,
        root_path: impl Into<PathBuf>,
        name: impl Into<String>,
        datafile: impl Into<PathBuf>,
    ) -> Result<Self> {
        let name = name.into();
        let datafile = datafile.into();
        let raw = std::fs::read_to_string(&datafile)
            .with_context(|| format!("package descriptor for '{name}' was not found"))?;
        let descriptor = Descriptor::from_yaml_str(&raw)
            .with_context(|| format!("package descriptor for '{name}' is corrupt"))?;

        Self::new(
            root,
            root_path,
            name,
            datafile,
            descriptor,
            Status::NotInstalled,
            Box::new(NullLoader),
        )
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Source root the package was created from. Transient per-run
    /// configuration; never persisted.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datafile(&self) -> &Path {
        &self.datafile
    }

    pub fn resource_dir(&self) -> &Path {
        &self.resource_dir
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut Descriptor {
        &mut self.descriptor
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_installed(&self) -> bool {
        self.status == Status::Installed
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }

    pub fn is_support(&self) -> bool {
        self.descriptor.support_flag() || names::is_support_name(&self.name)
    }

    pub fn requires_superuser(&self) -> bool {
        self.descriptor.requires_superuser()
    }

    pub fn description(&self) -> Option<String> {
        self.descriptor.description()
    }

    pub fn parent(&self) -> String {
        names::parent_name(&self.name)
    }

    /// Declared dependencies, plus the logical parent when `depend on
    /// parent` is in effect. Names are not guaranteed to refer to
    /// installable packages.
    pub fn dependencies(&self) -> Vec<String> {
        let mut dependencies = self.descriptor.declared_dependencies();
        let parent = self.parent();
        if self.descriptor.depends_on_parent() && !parent.is_empty() {
            dependencies.push(parent);
        }
        dependencies
    }

    pub fn ensure_status(&self, required: &[Status]) -> Result<()> {
        require_status(self.status, required)
    }

    /// Mark the package selected for installation.
    pub fn select(&mut self) -> Result<()> {
        self.ensure_status(&[Status::NotInstalled])?;
        self.status = Status::Marked;
        Ok(())
    }

    /// Clear a failure mark so the package can be retried.
    pub fn unselect(&mut self) -> Result<()> {
        self.ensure_status(&[Status::Failed])?;
        self.status = Status::NotInstalled;
        Ok(())
    }

    /// Record that executing the package's steps failed. Callable from any
    /// state; this is how dependency-failure cascades propagate.
    pub fn set_failed(&mut self) {
        self.status = Status::Failed;
    }

    /// Advance the lifecycle. The engine drives this after the stage
    /// executors succeed.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Re-serialize the descriptor, including any generated uninstall steps.
    pub fn serialize(&self) -> Result<String> {
        self.ensure_status(&[Status::NotInstalled, Status::Installed])?;
        self.descriptor.to_yaml_string()
    }

    /// Materialize resource files if the loader has not done so yet.
    pub fn load_resources(&mut self) -> Result<()> {
        let resource_dir = self.resource_dir.clone();
        self.loader.materialize(&resource_dir)
    }
}
