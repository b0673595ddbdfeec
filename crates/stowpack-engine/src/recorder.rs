//! Typed removal steps and the recorder that collects them during install.
//!
//! Install operations report the filesystem changes they made as removal
//! steps. The recorder keeps them newest-first, so undoing an install walks
//! back through the changes in reverse order. The collected steps are stored
//! in the descriptor under `generated uninstall` and replayed verbatim by the
//! uninstall stage, which is why the records keep their paths unexpanded.

use std::collections::VecDeque;

use anyhow::{bail, Result};

use stowpack_core::ActionRecord;

pub const OP_REMOVE_DIRS: &str = "remove_dirs";
pub const OP_REMOVE: &str = "remove";
pub const OP_REMOVE_TREE: &str = "remove_tree";
pub const OP_RESTORE: &str = "restore";

/// One removal step in its typed form.
#[derive(Debug, Clone, PartialEq)]
pub enum UninstallOp {
    /// Remove empty directories, innermost first. Best effort.
    RemoveDirs { dirs: Vec<String> },
    /// Remove files or symlinks, optionally resolved against `where_dir`.
    Remove {
        file: Option<String>,
        files: Option<Vec<String>>,
        where_dir: Option<String>,
        ignore_missing: bool,
    },
    /// Remove a whole directory tree.
    RemoveTree { dir: String },
    /// Restore previously backed-up file contents from the package archive.
    Restore {
        file: Option<String>,
        files: Option<Vec<String>>,
    },
}

impl UninstallOp {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::RemoveDirs { .. } => OP_REMOVE_DIRS,
            Self::Remove { .. } => OP_REMOVE,
            Self::RemoveTree { .. } => OP_REMOVE_TREE,
            Self::Restore { .. } => OP_RESTORE,
        }
    }

    /// Parse a removal step out of a generic record. `Ok(None)` means the
    /// record is some other operation (shell, print) and not a removal step.
    pub fn from_record(record: &ActionRecord, operation: &str) -> Result<Option<Self>> {
        let op = match operation {
            OP_REMOVE_DIRS => {
                let dirs = record
                    .str_list_arg("dirs")?
                    .ok_or_else(|| missing_arg(OP_REMOVE_DIRS, "dirs"))?;
                Self::RemoveDirs { dirs }
            }
            OP_REMOVE => Self::Remove {
                file: record.str_arg("file")?,
                files: record.str_list_arg("files")?,
                where_dir: record.str_arg("where")?,
                ignore_missing: record.bool_arg("ignore_missing", true)?,
            },
            OP_REMOVE_TREE => {
                let dir = record
                    .str_arg("dir")?
                    .ok_or_else(|| missing_arg(OP_REMOVE_TREE, "dir"))?;
                Self::RemoveTree { dir }
            }
            OP_RESTORE => Self::Restore {
                file: record.str_arg("file")?,
                files: record.str_list_arg("files")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(op))
    }

    /// Serialize back to a descriptor step. Absent optional arguments are
    /// omitted, as is `ignore_missing` at its default.
    pub fn to_record(&self) -> ActionRecord {
        let mut record = ActionRecord::new(self.operation());
        match self {
            Self::RemoveDirs { dirs } => record.set_str_list("dirs", dirs),
            Self::Remove {
                file,
                files,
                where_dir,
                ignore_missing,
            } => {
                if let Some(file) = file {
                    record.set_str("file", file);
                }
                if let Some(files) = files {
                    record.set_str_list("files", files);
                }
                if let Some(where_dir) = where_dir {
                    record.set_str("where", where_dir);
                }
                if !ignore_missing {
                    record.set_bool("ignore_missing", false);
                }
            }
            Self::RemoveTree { dir } => record.set_str("dir", dir),
            Self::Restore { file, files } => {
                if let Some(file) = file {
                    record.set_str("file", file);
                }
                if let Some(files) = files {
                    record.set_str_list("files", files);
                }
            }
        }
        record
    }
}

fn missing_arg(operation: &str, key: &str) -> anyhow::Error {
    anyhow::anyhow!("'{operation}' requires the '{key}' argument")
}

/// Consumer of removal steps. Install executors record into one of these;
/// the uninstall executor implements it to actually apply the removals.
pub trait UninstallSink {
    fn apply(&mut self, op: UninstallOp) -> Result<()>;
}

/// Sink that collects removal steps for the `generated uninstall` list.
#[derive(Debug, Default)]
pub struct UninstallRecorder {
    actions: VecDeque<ActionRecord>,
}

impl UninstallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn take(&mut self) -> Vec<ActionRecord> {
        std::mem::take(&mut self.actions).into()
    }
}

impl UninstallSink for UninstallRecorder {
    fn apply(&mut self, op: UninstallOp) -> Result<()> {
        // Newest first, so replaying undoes changes in reverse order.
        self.actions.push_front(op.to_record());
        Ok(())
    }
}
