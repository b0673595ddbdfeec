//! The uninstall stage: applies declared and generated removal steps. The
//! same typed operations the install stage records are executed here for
//! real, which keeps the two stages' vocabularies in lockstep.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use stowpack_core::{ActionRecord, ArgumentExpander, BackupStore, ConditionStore};

use crate::archive;
use crate::dispatch;
use crate::recorder::{UninstallOp, UninstallSink};
use crate::shell::ShellRunner;

/// Executes one package's uninstall steps.
pub struct UninstallExecutor<'a> {
    package_name: &'a str,
    base_dir: &'a Path,
    expander: &'a ArgumentExpander,
    conditions: &'a mut ConditionStore,
    backups: &'a dyn BackupStore,
}

impl<'a> UninstallExecutor<'a> {
    pub fn new(
        package_name: &'a str,
        base_dir: &'a Path,
        expander: &'a ArgumentExpander,
        conditions: &'a mut ConditionStore,
        backups: &'a dyn BackupStore,
    ) -> Self {
        Self {
            package_name,
            base_dir,
            expander,
            conditions,
            backups,
        }
    }

    /// Run one step; `Ok(false)` is a reported step failure.
    pub fn run(&mut self, record: &ActionRecord) -> Result<bool> {
        let operation = dispatch::operation_of(record)?;
        if !dispatch::should_run(record, self.conditions)? {
            debug!(package = self.package_name, operation, "step gated out, skipping");
            return Ok(true);
        }

        match operation.as_str() {
            "print" => {
                dispatch::print_step(self.package_name, record, self.expander)?;
                Ok(true)
            }
            "shell" => {
                let command = dispatch::require_str(record, "shell", "command")?;
                ShellRunner::new(self.expander, self.base_dir).shell(&command)
            }
            "shell_all" => {
                let commands = record
                    .str_list_arg("commands")?
                    .ok_or_else(|| anyhow!("'shell_all' requires the 'commands' argument"))?;
                ShellRunner::new(self.expander, self.base_dir).shell_all(&commands)
            }
            "shell_any" => {
                let commands = record
                    .str_list_arg("commands")?
                    .ok_or_else(|| anyhow!("'shell_any' requires the 'commands' argument"))?;
                ShellRunner::new(self.expander, self.base_dir).shell_any(&commands)
            }
            other => match UninstallOp::from_record(record, other)? {
                Some(op) => self.apply(op).map(|()| true),
                None => bail!("invalid action '{other}' for package stage 'uninstall'"),
            },
        }
    }

    fn expect_absolute(&self, raw: &str, argument: &str) -> Result<PathBuf> {
        let expanded = self.expander.expand(raw);
        let path = PathBuf::from(&expanded);
        if !path.is_absolute() {
            bail!("'{argument}' must be given as an absolute path: '{expanded}'");
        }
        Ok(path)
    }

    fn one_or_many(
        file: Option<String>,
        files: Option<Vec<String>>,
        operation: &str,
    ) -> Result<Vec<String>> {
        match (file, files) {
            (Some(_), Some(_)) => bail!("'{operation}' must specify either 'file' or 'files'"),
            (Some(file), None) => Ok(vec![file]),
            (None, Some(files)) => Ok(files),
            (None, None) => bail!("'{operation}' requires 'file' or 'files'"),
        }
    }

    fn remove_dirs(&self, dirs: Vec<String>) -> Result<()> {
        for dir in self.expander.expand_all(&dirs) {
            // Only empty directories go; shared parents stay behind.
            match std::fs::remove_dir(&dir) {
                Ok(()) => debug!(package = self.package_name, dir, "removed directory"),
                Err(error) => {
                    warn!(package = self.package_name, dir, %error, "directory was not removed");
                }
            }
        }
        Ok(())
    }

    fn remove(
        &self,
        file: Option<String>,
        files: Option<Vec<String>>,
        where_dir: Option<String>,
        ignore_missing: bool,
    ) -> Result<()> {
        let multiple = files.is_some();
        let entries = Self::one_or_many(file, files, "remove")?;

        let base = match where_dir {
            Some(where_dir) => {
                let base = self.expect_absolute(&where_dir, "where")?;
                if multiple && !base.is_dir() {
                    bail!("'where' must be an existing directory when given");
                }
                Some(base)
            }
            None => {
                for entry in &entries {
                    self.expect_absolute(entry, "file")
                        .context("if 'where' is not given, every path must be absolute")?;
                }
                None
            }
        };

        for entry in &entries {
            let expanded = self.expander.expand(entry);
            let path = match &base {
                Some(base) => base.join(&expanded),
                None => PathBuf::from(&expanded),
            };

            match std::fs::symlink_metadata(&path) {
                Ok(metadata) if metadata.is_file() || metadata.is_symlink() => {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("could not delete '{}'", path.display()))?;
                    debug!(package = self.package_name, path = %path.display(), "deleted file");
                }
                Ok(_) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    if !ignore_missing {
                        bail!("'{}' does not exist", path.display());
                    }
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("could not inspect '{}'", path.display()));
                }
            }
        }
        Ok(())
    }

    fn remove_tree(&self, dir: &str) -> Result<()> {
        let path = PathBuf::from(self.expander.expand(dir));
        if !path.is_dir() {
            bail!("'dir' must be an existing directory: '{}'", path.display());
        }
        debug!(package = self.package_name, dir = %path.display(), "removing tree");
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("could not remove tree '{}'", path.display()))
    }

    /// Write backed-up contents from the package archive back to disk. The
    /// archive entries are keyed by the unexpanded paths the install stage
    /// recorded.
    fn restore(&self, file: Option<String>, files: Option<Vec<String>>) -> Result<()> {
        let entries = Self::one_or_many(file, files, "restore")?;
        for entry in &entries {
            self.expect_absolute(entry, "file")?;
        }

        let archive_path = self.backups.package_archive_path(self.package_name)?;
        for entry in &entries {
            let target = PathBuf::from(self.expander.expand(entry));
            match archive::read_backup(&archive_path, entry)? {
                Some(data) => {
                    std::fs::write(&target, data)
                        .with_context(|| format!("could not restore '{}'", target.display()))?;
                    debug!(
                        package = self.package_name,
                        target = %target.display(),
                        "restored backed-up file"
                    );
                }
                None => {
                    warn!(
                        package = self.package_name,
                        target = %target.display(),
                        "won't restore: a corresponding backup was not found"
                    );
                }
            }
        }
        Ok(())
    }
}

impl UninstallSink for UninstallExecutor<'_> {
    fn apply(&mut self, op: UninstallOp) -> Result<()> {
        match op {
            UninstallOp::RemoveDirs { dirs } => self.remove_dirs(dirs),
            UninstallOp::Remove {
                file,
                files,
                where_dir,
                ignore_missing,
            } => self.remove(file, files, where_dir, ignore_missing),
            UninstallOp::RemoveTree { dir } => self.remove_tree(&dir),
            UninstallOp::Restore { file, files } => self.restore(file, files),
        }
    }
}
