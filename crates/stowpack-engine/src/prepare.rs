//! The prepare stage: steps that fetch or build material a package needs
//! before it can install anything. Everything runs inside the package's
//! scratch directory; the resource directory is only read from.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::debug;

use stowpack_core::{ActionRecord, ArgumentExpander, ConditionStore};

use crate::dispatch;
use crate::fsops;
use crate::shell::ShellRunner;

/// Asks the user for a value during prepare. The console implementation
/// reads stdin; tests substitute canned answers.
pub trait UserPrompt {
    fn prompt(&mut self, package: &str, short_name: &str, description: &str) -> Result<String>;
}

/// Interactive prompt on the controlling terminal.
#[derive(Debug, Default)]
pub struct ConsolePrompt;

impl UserPrompt for ConsolePrompt {
    fn prompt(&mut self, package: &str, short_name: &str, description: &str) -> Result<String> {
        println!("PACKAGE '{package}' REQUESTS INPUT: {description}");
        print!("{short_name}> ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("could not read the answer from standard input")?;
        Ok(answer.trim_end_matches('\n').to_string())
    }
}

/// Executes one package's prepare steps.
pub struct PrepareExecutor<'a> {
    package_name: &'a str,
    resource_dir: &'a Path,
    temp_dir: &'a Path,
    expander: &'a ArgumentExpander,
    conditions: &'a mut ConditionStore,
    prompter: &'a mut dyn UserPrompt,
}

impl<'a> PrepareExecutor<'a> {
    pub fn new(
        package_name: &'a str,
        resource_dir: &'a Path,
        temp_dir: &'a Path,
        expander: &'a ArgumentExpander,
        conditions: &'a mut ConditionStore,
        prompter: &'a mut dyn UserPrompt,
    ) -> Self {
        Self {
            package_name,
            resource_dir,
            temp_dir,
            expander,
            conditions,
            prompter,
        }
    }

    /// Run one step; `Ok(false)` is a reported step failure.
    pub fn run(&mut self, record: &ActionRecord) -> Result<bool> {
        let operation = dispatch::operation_of(record)?;
        if !dispatch::should_run(record, self.conditions)? {
            debug!(package = self.package_name, operation, "step gated out, skipping");
            return Ok(true);
        }

        let shell = ShellRunner::new(self.expander, self.temp_dir);
        match operation.as_str() {
            "print" => {
                dispatch::print_step(self.package_name, record, self.expander)?;
                Ok(true)
            }
            "copy_resource" => self.copy_resource(record).map(|()| true),
            "git_clone" => self.git_clone(record),
            "prompt_user" => self.prompt_user(record).map(|()| true),
            "shell" => shell.shell(&dispatch::require_str(record, "shell", "command")?),
            "shell_all" => {
                let commands = record
                    .str_list_arg("commands")?
                    .ok_or_else(|| anyhow::anyhow!("'shell_all' requires the 'commands' argument"))?;
                shell.shell_all(&commands)
            }
            "shell_any" => {
                let commands = record
                    .str_list_arg("commands")?
                    .ok_or_else(|| anyhow::anyhow!("'shell_any' requires the 'commands' argument"))?;
                shell.shell_any(&commands)
            }
            other => bail!("invalid action '{other}' for package stage 'prepare'"),
        }
    }

    /// Copy a file or directory out of the resource directory into the
    /// scratch directory, so later steps can modify it freely.
    fn copy_resource(&self, record: &ActionRecord) -> Result<()> {
        let path = dispatch::require_str(record, "copy_resource", "path")?;
        let relative = fsops::normalize_relative(&self.expander.expand(&path))?;

        let source = self.resource_dir.join(&relative);
        let target = self.temp_dir.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if source.is_dir() {
            fsops::copy_dir_recursive(&source, &target)
        } else if source.is_file() {
            std::fs::copy(&source, &target)
                .with_context(|| format!("could not copy resource '{}'", source.display()))?;
            Ok(())
        } else {
            bail!(
                "resource '{}' of '{}' does not exist",
                relative.display(),
                self.package_name
            )
        }
    }

    fn git_clone(&self, record: &ActionRecord) -> Result<bool> {
        let repository = dispatch::require_str(record, "git_clone", "repository")?;
        let repository = self.expander.expand(&repository);
        debug!(package = self.package_name, %repository, "cloning repository");

        let status = Command::new("git")
            .args(["clone", &repository, "--origin", "upstream", "--depth", "1"])
            .current_dir(self.temp_dir)
            .status()
            .with_context(|| format!("could not spawn git to clone '{repository}'"))?;
        Ok(status.success())
    }

    /// Ask the user for a value and stash it in the scratch directory, where
    /// `replace_user_input` steps of the install stage pick it up.
    fn prompt_user(&mut self, record: &ActionRecord) -> Result<()> {
        let short_name = dispatch::require_str(record, "prompt_user", "short_name")?;
        let variable = dispatch::require_str(record, "prompt_user", "variable")?;
        let description = record.str_arg("description")?.unwrap_or_default();

        let answer = self
            .prompter
            .prompt(self.package_name, &short_name, &description)?;
        let target = self.temp_dir.join(format!("var-{variable}"));
        std::fs::write(&target, answer)
            .with_context(|| format!("could not save the answer for variable '{variable}'"))
    }
}

#[cfg(test)]
mod tests {
    use stowpack_core::{ActionRecord, ArgumentExpander, Condition, ConditionProbe, ConditionStore};

    use super::{PrepareExecutor, UserPrompt};

    struct NoProbe;

    impl ConditionProbe for NoProbe {
        fn probe(&self, _condition: Condition) -> bool {
            false
        }
    }

    struct CannedPrompt(String);

    impl UserPrompt for CannedPrompt {
        fn prompt(&mut self, _package: &str, _short: &str, _description: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn step(yaml: &str) -> ActionRecord {
        ActionRecord::from_value(serde_yaml::from_str(yaml).expect("yaml must parse"))
            .expect("must be a step")
    }

    #[test]
    fn copy_resource_lands_in_the_scratch_directory() {
        let resources = tempfile::tempdir().expect("must create temp dir");
        let scratch = tempfile::tempdir().expect("must create temp dir");
        std::fs::create_dir(resources.path().join("conf")).expect("must create dir");
        std::fs::write(resources.path().join("conf/base.ini"), b"[core]").expect("must write");

        let expander = ArgumentExpander::new(false);
        let mut conditions = ConditionStore::new(Box::new(NoProbe));
        let mut prompter = CannedPrompt(String::new());
        let mut executor = PrepareExecutor::new(
            "tools.app",
            resources.path(),
            scratch.path(),
            &expander,
            &mut conditions,
            &mut prompter,
        );

        assert!(executor
            .run(&step("action: copy resource\npath: conf/base.ini\n"))
            .expect("must run"));
        assert_eq!(
            std::fs::read(scratch.path().join("conf/base.ini")).expect("must read"),
            b"[core]"
        );
    }

    #[test]
    fn copy_resource_refuses_paths_leaving_the_resources() {
        let resources = tempfile::tempdir().expect("must create temp dir");
        let scratch = tempfile::tempdir().expect("must create temp dir");
        let expander = ArgumentExpander::new(false);
        let mut conditions = ConditionStore::new(Box::new(NoProbe));
        let mut prompter = CannedPrompt(String::new());
        let mut executor = PrepareExecutor::new(
            "tools.app",
            resources.path(),
            scratch.path(),
            &expander,
            &mut conditions,
            &mut prompter,
        );

        let err = executor
            .run(&step("action: copy resource\npath: ../../etc/passwd\n"))
            .expect_err("escaping paths must be refused");
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn prompt_answers_are_stashed_for_later_stages() {
        let resources = tempfile::tempdir().expect("must create temp dir");
        let scratch = tempfile::tempdir().expect("must create temp dir");
        let expander = ArgumentExpander::new(false);
        let mut conditions = ConditionStore::new(Box::new(NoProbe));
        let mut prompter = CannedPrompt("alice@example.com".to_string());
        let mut executor = PrepareExecutor::new(
            "tools.git",
            resources.path(),
            scratch.path(),
            &expander,
            &mut conditions,
            &mut prompter,
        );

        assert!(executor
            .run(&step(
                "action: prompt user\nshort_name: email\nvariable: GIT_EMAIL\n\
                 description: Your commit e-mail address.\n"
            ))
            .expect("must run"));
        assert_eq!(
            std::fs::read_to_string(scratch.path().join("var-GIT_EMAIL")).expect("must read"),
            "alice@example.com"
        );
    }

    #[test]
    fn unknown_operations_are_fatal() {
        let resources = tempfile::tempdir().expect("must create temp dir");
        let scratch = tempfile::tempdir().expect("must create temp dir");
        let expander = ArgumentExpander::new(false);
        let mut conditions = ConditionStore::new(Box::new(NoProbe));
        let mut prompter = CannedPrompt(String::new());
        let mut executor = PrepareExecutor::new(
            "tools.app",
            resources.path(),
            scratch.path(),
            &expander,
            &mut conditions,
            &mut prompter,
        );

        let err = executor
            .run(&step("action: make dirs\ndirs:\n  - /tmp/x\n"))
            .expect_err("install-stage operations must not run in prepare");
        assert!(err.to_string().contains("'prepare'"));
    }
}
