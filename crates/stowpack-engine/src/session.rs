use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

/// Scratch space for one run. The session directory and every per-package
/// subdirectory under it are removed when the context drops, on every exit
/// path.
#[derive(Debug)]
pub struct SessionContext {
    root: TempDir,
    package_dirs: BTreeMap<String, PathBuf>,
}

impl SessionContext {
    pub fn new() -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("stowpack-")
            .tempdir()
            .context("could not create the session scratch directory")?;
        Ok(Self {
            root,
            package_dirs: BTreeMap::new(),
        })
    }

    /// The session-wide scratch directory, shared between packages.
    pub fn session_dir(&self) -> &Path {
        self.root.path()
    }

    /// Scratch directory private to one package, created on first request.
    pub fn package_dir(&mut self, package: &str) -> Result<PathBuf> {
        if let Some(dir) = self.package_dirs.get(package) {
            return Ok(dir.clone());
        }

        let dir = tempfile::Builder::new()
            .prefix(&format!("{package}-"))
            .tempdir_in(self.root.path())
            .with_context(|| format!("could not create scratch directory for '{package}'"))?
            .into_path();
        self.package_dirs.insert(package.to_string(), dir.clone());
        Ok(dir)
    }
}
