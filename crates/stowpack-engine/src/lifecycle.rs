//! Drives one package through its stages: prepare, install, uninstall. Each
//! stage checks the package's lifecycle status, runs the transformed step
//! list through the matching executor, and advances the status on success.

use anyhow::{bail, Result};
use tracing::{debug, info};

use stowpack_core::{
    ActionRecord, ArgumentExpander, BackupStore, ConditionStore, Package, Stage, Status,
};

use crate::install::InstallExecutor;
use crate::prepare::{PrepareExecutor, UserPrompt};
use crate::recorder::UninstallRecorder;
use crate::session::SessionContext;
use crate::transform::TransformerPipeline;
use crate::uninstall::UninstallExecutor;

/// Shared run-wide machinery for executing package stages.
pub struct StageRunner<'a> {
    session: &'a mut SessionContext,
    conditions: &'a mut ConditionStore,
    pipeline: &'a TransformerPipeline,
    backups: &'a dyn BackupStore,
    prompter: &'a mut dyn UserPrompt,
}

fn step_failure(stage: Stage, package: &str, step: &ActionRecord) -> anyhow::Error {
    anyhow::anyhow!(
        "execution of a {} action for '{}' failed; details of the step:\n{}",
        stage.as_str(),
        package,
        step.summary()
    )
}

impl<'a> StageRunner<'a> {
    pub fn new(
        session: &'a mut SessionContext,
        conditions: &'a mut ConditionStore,
        pipeline: &'a TransformerPipeline,
        backups: &'a dyn BackupStore,
        prompter: &'a mut dyn UserPrompt,
    ) -> Self {
        Self {
            session,
            conditions,
            pipeline,
            backups,
            prompter,
        }
    }

    /// Archive backing the named package in the run's backup store.
    pub fn archive_path(&self, name: &str) -> Result<std::path::PathBuf> {
        self.backups.package_archive_path(name)
    }

    /// Variable expander for one package's steps. `$PACKAGE_DIR` is the
    /// resource directory, `$TEMPORARY_DIR` the package's scratch space and
    /// `$SESSION_DIR` the scratch space shared by the whole run.
    pub fn build_expander(&mut self, package: &Package) -> Result<ArgumentExpander> {
        let mut expander = ArgumentExpander::new(true);
        expander.register_expansion(
            "PACKAGE_DIR",
            package.resource_dir().to_string_lossy(),
        );
        expander.register_expansion(
            "SESSION_DIR",
            self.session.session_dir().to_string_lossy(),
        );
        let temp_dir = self.session.package_dir(package.name())?;
        expander.register_expansion("TEMPORARY_DIR", temp_dir.to_string_lossy());
        Ok(expander)
    }

    /// Run the prepare stage. A package without prepare steps still advances
    /// to `PREPARED`.
    pub fn prepare(&mut self, package: &mut Package) -> Result<()> {
        package.ensure_status(&[Status::Marked])?;

        if package.descriptor().has_steps(Stage::Prepare) {
            package.load_resources()?;
            let name = package.name().to_string();
            let resource_dir = package.resource_dir().to_path_buf();
            let temp_dir = self.session.package_dir(&name)?;
            let expander = self.build_expander(package)?;
            let steps = self
                .pipeline
                .apply(Stage::Prepare, package.descriptor().steps(Stage::Prepare)?)?;

            info!(package = %name, "preparing");
            for step in &steps {
                let mut executor = PrepareExecutor::new(
                    &name,
                    &resource_dir,
                    &temp_dir,
                    &expander,
                    self.conditions,
                    self.prompter,
                );
                if !executor.run(step)? {
                    bail!(step_failure(Stage::Prepare, &name, step));
                }
            }
        }

        package.set_status(Status::Prepared);
        Ok(())
    }

    /// Run the install stage. The filesystem changes the steps report are
    /// collected and stored in the descriptor as the generated uninstall
    /// list.
    pub fn install(&mut self, package: &mut Package) -> Result<()> {
        package.ensure_status(&[Status::Prepared])?;
        package.load_resources()?;

        let name = package.name().to_string();
        let resource_dir = package.resource_dir().to_path_buf();
        let temp_dir = self.session.package_dir(&name)?;
        let expander = self.build_expander(package)?;
        let steps = self
            .pipeline
            .apply(Stage::Install, package.descriptor().steps(Stage::Install)?)?;

        info!(package = %name, "installing");
        let mut recorder = UninstallRecorder::new();
        for step in &steps {
            let mut executor = InstallExecutor::new(
                &name,
                &resource_dir,
                &temp_dir,
                &expander,
                self.conditions,
                &mut recorder,
                self.backups,
            );
            if !executor.run(step)? {
                bail!(step_failure(Stage::Install, &name, step));
            }
        }

        package.set_status(Status::Installed);
        if !recorder.is_empty() {
            debug!(package = %name, "saving the generated uninstall steps");
            package.descriptor_mut().set_generated_uninstall(recorder.take());
        }
        Ok(())
    }

    /// Run the uninstall stage: declared steps first, then the generated
    /// ones. A package without any still transitions to `NOT_INSTALLED`.
    pub fn uninstall(&mut self, package: &mut Package) -> Result<()> {
        package.ensure_status(&[Status::Installed])?;

        if package.descriptor().has_uninstall_steps() {
            package.load_resources()?;
            let name = package.name().to_string();
            let resource_dir = package.resource_dir().to_path_buf();
            let expander = self.build_expander(package)?;

            let mut steps = package.descriptor().steps(Stage::Uninstall)?;
            steps.extend(package.descriptor().generated_uninstall_steps()?);
            let steps = self.pipeline.apply(Stage::Uninstall, steps)?;

            info!(package = %name, "uninstalling");
            for step in &steps {
                let mut executor = UninstallExecutor::new(
                    &name,
                    &resource_dir,
                    &expander,
                    self.conditions,
                    self.backups,
                );
                if !executor.run(step)? {
                    bail!(step_failure(Stage::Uninstall, &name, step));
                }
            }
        }

        package.set_status(Status::NotInstalled);
        Ok(())
    }
}
