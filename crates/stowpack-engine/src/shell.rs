use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use stowpack_core::ArgumentExpander;

/// Runs `shell` family steps through `sh -c` with the stage's base directory
/// as the working directory. A non-zero exit is a reported failure, not an
/// error; failing to spawn the shell at all is an error.
pub struct ShellRunner<'a> {
    expander: &'a ArgumentExpander,
    work_dir: &'a Path,
}

impl<'a> ShellRunner<'a> {
    pub fn new(expander: &'a ArgumentExpander, work_dir: &'a Path) -> Self {
        Self { expander, work_dir }
    }

    pub fn shell(&self, command: &str) -> Result<bool> {
        let command = self.expander.expand(command);
        debug!(%command, "running shell step");
        let status = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(self.work_dir)
            .status()
            .with_context(|| format!("could not spawn shell for: {command}"))?;
        Ok(status.success())
    }

    /// Execute all commands in order; stop at the first failure.
    pub fn shell_all(&self, commands: &[String]) -> Result<bool> {
        for command in commands {
            if !self.shell(command)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Execute commands in order until one succeeds.
    pub fn shell_any(&self, commands: &[String]) -> Result<bool> {
        for command in commands {
            if self.shell(command)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
