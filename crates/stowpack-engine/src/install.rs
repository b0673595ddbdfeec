//! The install stage: operations that put a package's files onto the
//! system. Every operation reports the changes it made to an
//! [`UninstallSink`](crate::recorder::UninstallSink), and the recorded paths
//! keep their unexpanded `$VAR` forms so the generated uninstall steps stay
//! portable across machines.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use tracing::debug;

use stowpack_core::{ActionRecord, ArgumentExpander, BackupStore, ConditionStore};

use crate::archive;
use crate::dispatch;
use crate::fsops;
use crate::recorder::{UninstallOp, UninstallSink};
use crate::shell::ShellRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    Copy,
    Symlink,
}

impl LinkKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Symlink => "symlink",
        }
    }
}

/// Executes one package's install steps.
pub struct InstallExecutor<'a> {
    package_name: &'a str,
    base_dir: &'a Path,
    temp_dir: &'a Path,
    expander: &'a ArgumentExpander,
    conditions: &'a mut ConditionStore,
    recorder: &'a mut dyn UninstallSink,
    backups: &'a dyn BackupStore,
}

impl<'a> InstallExecutor<'a> {
    pub fn new(
        package_name: &'a str,
        base_dir: &'a Path,
        temp_dir: &'a Path,
        expander: &'a ArgumentExpander,
        conditions: &'a mut ConditionStore,
        recorder: &'a mut dyn UninstallSink,
        backups: &'a dyn BackupStore,
    ) -> Self {
        Self {
            package_name,
            base_dir,
            temp_dir,
            expander,
            conditions,
            recorder,
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
            "make_dirs" => self.make_dirs(record).map(|()| true),
            "copy" => self.copy_or_symlink(record, LinkKind::Copy).map(|()| true),
            "symlink" => self.copy_or_symlink(record, LinkKind::Symlink).map(|()| true),
            "copy_tree" => self.copy_tree(record).map(|()| true),
            "replace" => self.replace(record).map(|()| true),
            "replace_user_input" => self.replace_user_input(record).map(|()| true),
            "substitute_environment_variables" => {
                self.substitute_environment_variables(record).map(|()| true)
            }
            other => bail!("invalid action '{other}' for package stage 'install'"),
        }
    }

    /// Resolve a possibly relative, already expanded path against the stage's
    /// base directory.
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Create directories with their missing parents, and record the whole
    /// chain so uninstall can prune whichever levels this install introduced.
    fn make_dirs(&mut self, record: &ActionRecord) -> Result<()> {
        let dirs = record
            .str_list_arg("dirs")?
            .ok_or_else(|| anyhow!("'make_dirs' requires the 'dirs' argument"))?;

        for dir in &dirs {
            // Innermost first, matching the rmdir order at uninstall. The
            // chain keeps the unexpanded form.
            let chain: Vec<String> = Path::new(dir)
                .ancestors()
                .map(|ancestor| ancestor.to_string_lossy().into_owned())
                .filter(|part| !part.is_empty() && part != "/")
                .collect();

            let target = self.resolve(&self.expander.expand(dir));
            debug!(package = self.package_name, dir = %target.display(), "creating directories");
            std::fs::create_dir_all(&target)
                .with_context(|| format!("could not create directory '{}'", target.display()))?;
            self.recorder.apply(UninstallOp::RemoveDirs { dirs: chain })?;
        }
        Ok(())
    }

    /// Destination of one copy/symlink. With a prefix or when the file name
    /// must be kept, the source's name is appended to `to`; the prefix is
    /// then prepended to the final file name.
    fn calculate_copy_target(
        source: &str,
        to: &str,
        prefix: &str,
        include_filename: bool,
    ) -> String {
        let mut target = to.to_string();
        if !prefix.is_empty() || include_filename {
            target = fsops::join_str(to, fsops::basename_str(source));
        }
        if !prefix.is_empty() {
            let (dir, file) = fsops::split_str(&target);
            target = fsops::join_str(dir, &format!("{prefix}{file}"));
        }
        target
    }

    fn copy_or_symlink(&mut self, record: &ActionRecord, kind: LinkKind) -> Result<()> {
        let to_raw = dispatch::require_str(record, kind.as_str(), "to")?;
        let file = record.str_arg("file")?;
        let files = record.str_list_arg("files")?;
        let from = record.str_arg("from")?;
        let prefix = record.str_arg("prefix")?.unwrap_or_default();
        let relative = kind == LinkKind::Symlink && record.bool_arg("relative", false)?;

        if file.is_some() && files.is_some() {
            bail!(
                "'{}' must specify either (file, to) or (files, to)",
                kind.as_str()
            );
        }
        if file.is_some() && !prefix.is_empty() {
            bail!(
                "if only a single file is specified, use the 'to' argument \
                 to specify the whole destination name"
            );
        }

        let to = self.expander.expand(&to_raw);
        if !Path::new(&to).is_absolute() {
            bail!("'to' must be given as an absolute path");
        }

        let multiple = files.is_some();
        if multiple && !Path::new(&to).is_dir() {
            bail!(
                "'to' must be an existing directory when {}ing multiple files",
                kind.as_str()
            );
        }

        let sources = match (&file, &files) {
            (_, Some(files)) => files.clone(),
            (Some(file), None) => vec![file.clone()],
            (None, None) => bail!("'{}' requires 'file' or 'files'", kind.as_str()),
        };

        let mut recorded = Vec::with_capacity(sources.len());
        for entry in &sources {
            let mut source = self.expander.expand(entry);
            if let Some(from) = &from {
                source = fsops::join_str(&self.expander.expand(from), &source);
            }
            let source_path = self.resolve(&source);

            // A directory source symlinked into a directory target must keep
            // the full link path in `to`; a plain file into a directory gets
            // its name appended.
            let include_filename = kind == LinkKind::Symlink
                && !source_path.is_dir()
                && Path::new(&to).is_dir();

            let target = self.expander.expand(&Self::calculate_copy_target(
                &source,
                &to,
                &prefix,
                include_filename,
            ));
            let target_path = PathBuf::from(&target);
            debug!(
                package = self.package_name,
                kind = kind.as_str(),
                source = %source_path.display(),
                target = %target_path.display(),
                "deploying file"
            );

            match kind {
                LinkKind::Copy => {
                    let destination = if target_path.is_dir() {
                        target_path.join(fsops::file_name_of(&source_path)?)
                    } else {
                        target_path.clone()
                    };
                    std::fs::copy(&source_path, &destination).with_context(|| {
                        format!(
                            "could not copy '{}' to '{}'",
                            source_path.display(),
                            destination.display()
                        )
                    })?;
                }
                LinkKind::Symlink => {
                    if target_path.exists() && !target_path.is_dir() {
                        std::fs::remove_file(&target_path).with_context(|| {
                            format!("could not replace '{}'", target_path.display())
                        })?;
                    }

                    let points_to = if relative {
                        let parent = target_path
                            .parent()
                            .ok_or_else(|| anyhow!("'to' has no parent directory"))?;
                        fsops::relative_path(&source_path, parent)
                    } else {
                        source_path.clone()
                    };
                    std::os::unix::fs::symlink(&points_to, &target_path).with_context(|| {
                        format!("could not create link '{}'", target_path.display())
                    })?;
                }
            }

            // The record keeps the unexpanded 'to', so the step replays on a
            // machine with different variable values.
            let mut recorded_path =
                Self::calculate_copy_target(&source, &to_raw, &prefix, include_filename);
            let metadata = std::fs::symlink_metadata(&target_path);
            if target_path.is_dir() && !metadata.map(|m| m.is_symlink()).unwrap_or(false) {
                recorded_path = fsops::join_str(&recorded_path, fsops::basename_str(&source));
            }
            recorded.push(recorded_path);
        }

        if multiple {
            self.recorder.apply(UninstallOp::Remove {
                file: None,
                files: Some(recorded),
                where_dir: None,
                ignore_missing: true,
            })?;
        } else if let Some(path) = recorded.into_iter().next() {
            self.recorder.apply(UninstallOp::Remove {
                file: Some(path),
                files: None,
                where_dir: None,
                ignore_missing: true,
            })?;
        }
        Ok(())
    }

    /// Copy a whole directory tree; the destination must not exist yet.
    fn copy_tree(&mut self, record: &ActionRecord) -> Result<()> {
        let dir = dispatch::require_str(record, "copy_tree", "dir")?;
        let to_raw = dispatch::require_str(record, "copy_tree", "to")?;

        // Recorded before copying: a partially written tree still gets
        // cleaned up by the generated steps.
        self.recorder.apply(UninstallOp::RemoveTree {
            dir: to_raw.clone(),
        })?;

        let source = self.resolve(&self.expander.expand(&dir));
        let target = self.resolve(&self.expander.expand(&to_raw));
        if target.exists() {
            bail!("'to' must not exist yet: '{}'", target.display());
        }
        debug!(
            package = self.package_name,
            source = %source.display(),
            target = %target.display(),
            "copying tree"
        );
        fsops::copy_dir_recursive(&source, &target)
    }

    /// Like `copy`, but the overwritten file's previous contents go into the
    /// package archive first, and a `restore` step is recorded alongside the
    /// removal.
    fn replace(&mut self, record: &ActionRecord) -> Result<()> {
        let at = dispatch::require_str(record, "replace", "at")?;
        let with_file = record.str_arg("with_file")?;
        let with_files = record.str_list_arg("with_files")?;
        let from = record.str_arg("from")?;
        let prefix = record.str_arg("prefix")?.unwrap_or_default();

        let sources = match (&with_file, &with_files) {
            (_, Some(files)) => files.clone(),
            (Some(file), None) => vec![file.clone()],
            (None, None) => bail!("'replace' requires 'with file' or 'with files'"),
        };

        let archive_path = self.backups.package_archive_path(self.package_name)?;
        for mut entry in sources {
            if let Some(from) = &from {
                entry = fsops::join_str(&self.expander.expand(from), &entry);
            }
            let target = Self::calculate_copy_target(&entry, &at, &prefix, false);
            let target_real = self.expander.expand(&Self::calculate_copy_target(
                &self.expander.expand(&entry),
                &at,
                &prefix,
                false,
            ));
            let target_real = self.resolve(&target_real);

            match std::fs::read(&target_real) {
                Ok(previous) => {
                    debug!(
                        package = self.package_name,
                        target = %target_real.display(),
                        "backing up the replaced file"
                    );
                    archive::append_backup(&archive_path, &target, &previous)?;
                    self.recorder.apply(UninstallOp::Restore {
                        file: Some(target.clone()),
                        files: None,
                    })?;
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    // Nothing to back up; the copy below just creates it.
                }
                Err(error) => {
                    return Err(error).with_context(|| {
                        format!("could not back up '{}'", target_real.display())
                    });
                }
            }

            let mut copy = ActionRecord::new("copy");
            copy.set_str("to", &target);
            copy.set_str("file", &entry);
            self.copy_or_symlink(&copy, LinkKind::Copy)?;
        }
        Ok(())
    }

    fn rewrite_file<F>(&self, record: &ActionRecord, operation: &str, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Result<String>,
    {
        let file = dispatch::require_str(record, operation, "file")?;
        let path = self.resolve(&self.expander.expand(&file));
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read '{}'", path.display()))?;

        let pattern = Regex::new(r"\$<([\w-]+)>").expect("placeholder pattern is valid");
        let mut out = String::with_capacity(content.len());
        let mut last = 0;
        for captures in pattern.captures_iter(&content) {
            let whole = captures.get(0).expect("the full match always exists");
            out.push_str(&content[last..whole.start()]);
            out.push_str(&lookup(&captures[1])?);
            last = whole.end();
        }
        out.push_str(&content[last..]);

        std::fs::write(&path, out)
            .with_context(|| format!("could not write back '{}'", path.display()))
    }

    /// Substitute `$<NAME>` placeholders with the answers collected by
    /// `prompt_user` during prepare.
    fn replace_user_input(&self, record: &ActionRecord) -> Result<()> {
        self.rewrite_file(record, "replace_user_input", |name| {
            let source = self.temp_dir.join(format!("var-{name}"));
            std::fs::read_to_string(&source)
                .map_err(|_| anyhow!("no user input for variable '{name}' was provided"))
        })
    }

    /// Substitute `$<NAME>` placeholders from the process environment, with
    /// a lowercase fallback. An unset variable is fatal.
    fn substitute_environment_variables(&self, record: &ActionRecord) -> Result<()> {
        let package = self.package_name;
        self.rewrite_file(record, "substitute_environment_variables", |name| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .or_else(|| {
                    std::env::var(name.to_lowercase())
                        .ok()
                        .filter(|value| !value.is_empty())
                })
                .ok_or_else(|| {
                    anyhow!(
                        "cannot substitute environment variable '{name}' for \
                         '{package}': the variable is not set"
                    )
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use stowpack_core::{
        ActionRecord, ArgumentExpander, BackupStore, Condition, ConditionProbe, ConditionStore,
    };

    use crate::archive;
    use crate::recorder::{UninstallRecorder, UninstallSink};

    use super::InstallExecutor;

    struct NoProbe;

    impl ConditionProbe for NoProbe {
        fn probe(&self, _condition: Condition) -> bool {
            false
        }
    }

    struct DirBackups(PathBuf);

    impl BackupStore for DirBackups {
        fn package_archive_path(&self, name: &str) -> anyhow::Result<PathBuf> {
            Ok(self.0.join(format!("{name}.zip")))
        }
    }

    struct Fixture {
        resources: tempfile::TempDir,
        scratch: tempfile::TempDir,
        state: tempfile::TempDir,
        target: tempfile::TempDir,
        expander: ArgumentExpander,
        conditions: ConditionStore,
        recorder: UninstallRecorder,
    }

    impl Fixture {
        fn new() -> Self {
            let resources = tempfile::tempdir().expect("must create temp dir");
            let scratch = tempfile::tempdir().expect("must create temp dir");
            let state = tempfile::tempdir().expect("must create temp dir");
            let target = tempfile::tempdir().expect("must create temp dir");

            let mut expander = ArgumentExpander::new(false);
            expander.register_expansion("TARGET", target.path().to_string_lossy());
            expander.register_expansion(
                "TEMPORARY_DIR",
                scratch.path().to_string_lossy(),
            );

            Self {
                resources,
                scratch,
                state,
                target,
                expander,
                conditions: ConditionStore::new(Box::new(NoProbe)),
                recorder: UninstallRecorder::new(),
            }
        }

        fn run(&mut self, yaml: &str) -> anyhow::Result<bool> {
            let record = ActionRecord::from_value(
                serde_yaml::from_str(yaml).expect("yaml must parse"),
            )
            .expect("must be a step");
            let backups = DirBackups(self.state.path().to_path_buf());
            let mut executor = InstallExecutor::new(
                "tools.app",
                self.resources.path(),
                self.scratch.path(),
                &self.expander,
                &mut self.conditions,
                &mut self.recorder,
                &backups,
            );
            executor.run(&record)
        }
    }

    #[test]
    fn make_dirs_records_the_unexpanded_chain() {
        let mut fixture = Fixture::new();
        assert!(fixture
            .run("action: make dirs\ndirs:\n  - $TARGET/a/b/c\n")
            .expect("must run"));
        assert!(fixture.target.path().join("a/b/c").is_dir());

        let actions = fixture.recorder.take();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].str_list_arg("dirs").expect("must read"),
            Some(vec![
                "$TARGET/a/b/c".to_string(),
                "$TARGET/a/b".to_string(),
                "$TARGET/a".to_string(),
                "$TARGET".to_string(),
            ])
        );
    }

    #[test]
    fn copy_deploys_and_records_removal() {
        let mut fixture = Fixture::new();
        std::fs::write(fixture.resources.path().join("vimrc"), b"config")
            .expect("must write");

        assert!(fixture
            .run("action: copy\nfile: vimrc\nto: $TARGET/.vimrc\n")
            .expect("must run"));
        assert_eq!(
            std::fs::read(fixture.target.path().join(".vimrc")).expect("must read"),
            b"config"
        );

        let actions = fixture.recorder.take();
        assert_eq!(actions[0].operation().expect("has action"), "remove");
        assert_eq!(
            actions[0].str_arg("file").expect("must read"),
            Some("$TARGET/.vimrc".to_string())
        );
    }

    #[test]
    fn single_file_with_prefix_is_refused() {
        let mut fixture = Fixture::new();
        let err = fixture
            .run("action: copy\nfile: vimrc\nto: $TARGET\nprefix: 'dot-'\n")
            .expect_err("prefix with a single file must be refused");
        assert!(err.to_string().contains("'to'"));
    }

    #[test]
    fn multi_file_copy_applies_the_prefix() {
        let mut fixture = Fixture::new();
        std::fs::write(fixture.resources.path().join("motd"), b"hello").expect("must write");
        std::fs::write(fixture.resources.path().join("issue"), b"issue").expect("must write");

        assert!(fixture
            .run("action: copy\nfiles:\n  - motd\n  - issue\nto: $TARGET\nprefix: 'etc-'\n")
            .expect("must run"));
        assert!(fixture.target.path().join("etc-motd").is_file());
        assert!(fixture.target.path().join("etc-issue").is_file());

        let actions = fixture.recorder.take();
        assert_eq!(
            actions[0].str_list_arg("files").expect("must read"),
            Some(vec![
                "$TARGET/etc-motd".to_string(),
                "$TARGET/etc-issue".to_string(),
            ])
        );
    }

    #[test]
    fn symlink_into_directory_keeps_the_file_name() {
        let mut fixture = Fixture::new();
        std::fs::write(fixture.resources.path().join("vimrc"), b"config")
            .expect("must write");

        assert!(fixture
            .run("action: symlink\nfile: vimrc\nto: $TARGET\n")
            .expect("must run"));
        let link = fixture.target.path().join("vimrc");
        assert!(link.is_symlink());
        assert_eq!(
            std::fs::read(&link).expect("link must resolve"),
            b"config"
        );

        let actions = fixture.recorder.take();
        assert_eq!(
            actions[0].str_arg("file").expect("must read"),
            Some("$TARGET/vimrc".to_string())
        );
    }

    #[test]
    fn relative_symlinks_point_through_the_parent() {
        let mut fixture = Fixture::new();
        std::fs::write(fixture.resources.path().join("profile"), b"export A=1")
            .expect("must write");

        assert!(fixture
            .run("action: symlink\nfile: profile\nto: $TARGET/.profile\nrelative: true\n")
            .expect("must run"));
        let link = fixture.target.path().join(".profile");
        let points_to = std::fs::read_link(&link).expect("must be a link");
        assert!(points_to.is_relative());
        assert_eq!(
            std::fs::read(&link).expect("link must resolve"),
            b"export A=1"
        );
    }

    #[test]
    fn copy_tree_refuses_an_existing_destination() {
        let mut fixture = Fixture::new();
        std::fs::create_dir(fixture.resources.path().join("colors")).expect("must create");

        let err = fixture
            .run("action: copy tree\ndir: colors\nto: $TARGET\n")
            .expect_err("an existing destination must be refused");
        assert!(err.to_string().contains("must not exist"));
        // The removal was still recorded, covering a partial copy.
        assert!(!fixture.recorder.is_empty());
    }

    #[test]
    fn replace_backs_up_and_records_restore() {
        let mut fixture = Fixture::new();
        std::fs::write(fixture.resources.path().join("motd"), b"new greeting")
            .expect("must write");
        std::fs::write(fixture.target.path().join("motd"), b"old greeting")
            .expect("must write");

        assert!(fixture
            .run("action: replace\nat: $TARGET/motd\nwith file: motd\n")
            .expect("must run"));
        assert_eq!(
            std::fs::read(fixture.target.path().join("motd")).expect("must read"),
            b"new greeting"
        );

        let archive_path = fixture.state.path().join("tools.app.zip");
        let backup = archive::read_backup(&archive_path, "$TARGET/motd")
            .expect("must read")
            .expect("backup entry must exist");
        assert_eq!(backup, b"old greeting");

        let actions = fixture.recorder.take();
        // Newest first: the copy's removal, then the restore.
        assert_eq!(actions[0].operation().expect("has action"), "remove");
        assert_eq!(actions[1].operation().expect("has action"), "restore");
        assert_eq!(
            actions[1].str_arg("file").expect("must read"),
            Some("$TARGET/motd".to_string())
        );
    }

    #[test]
    fn replace_of_a_missing_file_skips_the_backup() {
        let mut fixture = Fixture::new();
        std::fs::write(fixture.resources.path().join("motd"), b"greeting")
            .expect("must write");

        assert!(fixture
            .run("action: replace\nat: $TARGET/motd\nwith file: motd\n")
            .expect("must run"));

        let actions = fixture.recorder.take();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].operation().expect("has action"), "remove");
    }

    #[test]
    fn user_input_placeholders_are_substituted() {
        let mut fixture = Fixture::new();
        std::fs::write(
            fixture.scratch.path().join("var-EMAIL"),
            b"alice@example.com",
        )
        .expect("must write");
        std::fs::write(
            fixture.target.path().join("gitconfig"),
            b"[user]\n  email = $<EMAIL>\n",
        )
        .expect("must write");

        assert!(fixture
            .run("action: replace user input\nfile: $TARGET/gitconfig\n")
            .expect("must run"));
        assert_eq!(
            std::fs::read_to_string(fixture.target.path().join("gitconfig"))
                .expect("must read"),
            "[user]\n  email = alice@example.com\n"
        );
    }

    #[test]
    fn missing_user_input_is_fatal() {
        let mut fixture = Fixture::new();
        std::fs::write(fixture.target.path().join("conf"), b"$<NEVER_ASKED>")
            .expect("must write");

        let err = fixture
            .run("action: replace user input\nfile: $TARGET/conf\n")
            .expect_err("a placeholder without an answer must fail");
        assert!(err.to_string().contains("NEVER_ASKED"));
    }

    #[test]
    fn environment_placeholders_substitute_with_lowercase_fallback() {
        let mut fixture = Fixture::new();
        std::env::set_var("stowpack_install_test_var", "lowered");
        std::fs::write(
            fixture.target.path().join("conf"),
            b"value = $<STOWPACK_INSTALL_TEST_VAR>",
        )
        .expect("must write");

        assert!(fixture
            .run("action: substitute environment variables\nfile: $TARGET/conf\n")
            .expect("must run"));
        assert_eq!(
            std::fs::read_to_string(fixture.target.path().join("conf")).expect("must read"),
            "value = lowered"
        );
    }

    #[test]
    fn unknown_operations_are_fatal() {
        let mut fixture = Fixture::new();
        let err = fixture
            .run("action: git clone\nrepository: https://example.com/r.git\n")
            .expect_err("prepare-stage operations must not run in install");
        assert!(err.to_string().contains("'install'"));
    }
}
