//! Package archives: one zip per package, appended to over its lifetime.
//!
//! At install time the archive receives a snapshot of the package's resource
//! files and its descriptor, plus backups of any files a `replace` step
//! overwrote. At uninstall time the same archive is the source of truth: the
//! descriptor (with its generated uninstall steps) and the resources come
//! back out of it, and `restore` reads the backed-up file contents.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use stowpack_core::{names, Descriptor, Package, ResourceLoader, Status};

/// Entry-name prefix for the package's resource files.
pub const RESOURCE_PREFIX: &str = "$PACKAGE_DIR/";
/// Entry name of the serialized descriptor.
pub const DESCRIPTOR_ENTRY: &str = "package.yaml";

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Open the archive for appending, creating it when absent.
fn open_writer(path: &Path) -> Result<ZipWriter<File>> {
    if path.exists() {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("could not open archive '{}'", path.display()))?;
        ZipWriter::new_append(file)
            .with_context(|| format!("archive '{}' is corrupt", path.display()))
    } else {
        let file = File::create(path)
            .with_context(|| format!("could not create archive '{}'", path.display()))?;
        Ok(ZipWriter::new(file))
    }
}

/// Append one backup entry. Leading slashes are stripped from the entry name
/// so absolute target paths key cleanly; `read_backup` strips them the same
/// way.
pub fn append_backup(path: &Path, entry: &str, data: &[u8]) -> Result<()> {
    let mut writer = open_writer(path)?;
    writer
        .start_file(entry.trim_start_matches('/'), entry_options())
        .with_context(|| format!("could not add '{entry}' to '{}'", path.display()))?;
    writer.write_all(data)?;
    writer.finish()?;
    debug!(archive = %path.display(), entry, "backed up file contents");
    Ok(())
}

/// Read a backup entry back out. `Ok(None)` when the archive or the entry
/// does not exist.
pub fn read_backup(path: &Path, entry: &str) -> Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)
        .with_context(|| format!("could not open archive '{}'", path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("archive '{}' is corrupt", path.display()))?;

    let mut entry_file = match archive.by_name(entry.trim_start_matches('/')) {
        Ok(entry_file) => entry_file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("could not read '{entry}' from '{}'", path.display()))
        }
    };

    let mut data = Vec::new();
    entry_file.read_to_end(&mut data)?;
    Ok(Some(data))
}

/// Snapshot the package into its archive: every resource file (skipping
/// nested packages, which own their files) plus the current descriptor.
pub fn save_package_archive(package: &Package, path: &Path) -> Result<()> {
    let resource_dir = package.resource_dir().to_path_buf();
    let mut writer = open_writer(path)?;

    let walker = WalkDir::new(&resource_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            // A subdirectory with its own descriptor is a nested package.
            !(entry.depth() > 0
                && entry.file_type().is_dir()
                && entry.path().join(names::DESCRIPTOR_FILE).is_file())
        });

    for entry in walker {
        let entry = entry.with_context(|| {
            format!("could not walk resources of '{}'", package.name())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name() == names::DESCRIPTOR_FILE {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(&resource_dir)
            .expect("walked entries live under the resource directory");
        let name = format!("{RESOURCE_PREFIX}{}", relative.display());
        let data = std::fs::read(entry.path())
            .with_context(|| format!("could not read '{}'", entry.path().display()))?;
        writer.start_file(&name, entry_options())?;
        writer.write_all(&data)?;
    }

    writer.start_file(DESCRIPTOR_ENTRY, entry_options())?;
    writer.write_all(package.serialize()?.as_bytes())?;
    writer.finish()?;
    debug!(package = package.name(), archive = %path.display(), "saved package snapshot");
    Ok(())
}

/// Lazily extracts a package's resource files from its archive. Installed
/// packages carry this loader so the files are only unpacked when a stage
/// actually needs them.
#[derive(Debug)]
pub struct ArchiveLoader {
    archive: PathBuf,
    extracted: bool,
}

impl ArchiveLoader {
    pub fn new(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
            extracted: false,
        }
    }
}

impl ResourceLoader for ArchiveLoader {
    fn materialize(&mut self, resource_dir: &Path) -> Result<()> {
        if self.extracted {
            return Ok(());
        }

        let file = File::open(&self.archive)
            .with_context(|| format!("could not open archive '{}'", self.archive.display()))?;
        let mut archive = ZipArchive::new(file)
            .with_context(|| format!("archive '{}' is corrupt", self.archive.display()))?;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let name = entry.name().to_string();
            let Some(relative) = name.strip_prefix(RESOURCE_PREFIX) else {
                continue;
            };
            if relative.is_empty() || name.ends_with('/') {
                continue;
            }

            let target = resource_dir.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            std::fs::write(&target, data)
                .with_context(|| format!("could not extract '{}'", target.display()))?;
        }

        debug!(archive = %self.archive.display(), "extracted package resources");
        self.extracted = true;
        Ok(())
    }
}

/// Rebuild an installed package from its archive. The descriptor is unpacked
/// into the package's scratch directory; resource files stay in the archive
/// until a stage asks for them.
pub fn load_installed_package(
    name: &str,
    archive_path: &Path,
    package_dir: &Path,
) -> Result<Package> {
    let raw = read_backup(archive_path, DESCRIPTOR_ENTRY)?.ok_or_else(|| {
        anyhow!(
            "archive '{}' for '{name}' has no package descriptor",
            archive_path.display()
        )
    })?;
    let text = String::from_utf8(raw)
        .with_context(|| format!("package descriptor for '{name}' is corrupt"))?;
    let descriptor = Descriptor::from_yaml_str(&text)
        .with_context(|| format!("package descriptor for '{name}' is corrupt"))?;

    let datafile = package_dir.join(names::DESCRIPTOR_FILE);
    std::fs::write(&datafile, &text)
        .with_context(|| format!("could not unpack descriptor for '{name}'"))?;

    Package::new(
        "",
        PathBuf::new(),
        name,
        datafile,
        descriptor,
        Status::Installed,
        Box::new(ArchiveLoader::new(archive_path)),
    )
}

#[cfg(test)]
mod tests {
    use stowpack_core::{Package, Status};

    use super::{append_backup, load_installed_package, read_backup, save_package_archive};

    fn disk_package(dir: &std::path::Path, name: &str, yaml: &str) -> Package {
        let datafile = dir.join("package.yaml");
        std::fs::write(&datafile, yaml).expect("must write descriptor");
        Package::from_descriptor_file("default", dir, name, datafile).expect("must build")
    }

    #[test]
    fn backups_round_trip_with_absolute_keys() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let archive = dir.path().join("pkg.zip");

        append_backup(&archive, "/etc/motd", b"original").expect("must append");
        let data = read_backup(&archive, "/etc/motd").expect("must read");
        assert_eq!(data.as_deref(), Some(&b"original"[..]));
        // Same entry whether the caller keeps or strips the leading slash.
        let data = read_backup(&archive, "etc/motd").expect("must read");
        assert_eq!(data.as_deref(), Some(&b"original"[..]));
    }

    #[test]
    fn missing_archive_or_entry_reads_as_none() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let archive = dir.path().join("pkg.zip");
        assert!(read_backup(&archive, "/etc/motd")
            .expect("must read")
            .is_none());

        append_backup(&archive, "/etc/motd", b"x").expect("must append");
        assert!(read_backup(&archive, "/etc/other")
            .expect("must read")
            .is_none());
    }

    #[test]
    fn snapshot_and_reload_round_trip() {
        let source = tempfile::tempdir().expect("must create temp dir");
        std::fs::write(source.path().join("vimrc"), b"set nocompatible").expect("must write");
        std::fs::create_dir(source.path().join("colors")).expect("must create dir");
        std::fs::write(source.path().join("colors/theme.vim"), b"hi Normal").expect("must write");

        let mut package = disk_package(
            source.path(),
            "editors.vim",
            "description: The Vim editor.\n",
        );
        package.set_status(Status::Installed);

        let state = tempfile::tempdir().expect("must create temp dir");
        let archive = state.path().join("editors.vim_1_0.zip");
        save_package_archive(&package, &archive).expect("must snapshot");

        let scratch = tempfile::tempdir().expect("must create temp dir");
        let mut reloaded =
            load_installed_package("editors.vim", &archive, scratch.path()).expect("must reload");
        assert_eq!(reloaded.status(), Status::Installed);
        assert_eq!(
            reloaded.description().as_deref(),
            Some("The Vim editor.")
        );

        reloaded.load_resources().expect("must extract");
        assert_eq!(
            std::fs::read(scratch.path().join("vimrc")).expect("must read"),
            b"set nocompatible"
        );
        assert_eq!(
            std::fs::read(scratch.path().join("colors/theme.vim")).expect("must read"),
            b"hi Normal"
        );
        // A second materialization is a no-op.
        reloaded.load_resources().expect("must stay extracted");
    }

    #[test]
    fn nested_packages_are_left_out_of_the_snapshot() {
        let source = tempfile::tempdir().expect("must create temp dir");
        std::fs::write(source.path().join("vimrc"), b"config").expect("must write");
        std::fs::create_dir(source.path().join("plugins")).expect("must create dir");
        std::fs::write(source.path().join("plugins/package.yaml"), "description: nested\n")
            .expect("must write");
        std::fs::write(source.path().join("plugins/list"), b"owned by the child")
            .expect("must write");

        let mut package = disk_package(source.path(), "editors.vim", "");
        package.set_status(Status::Installed);

        let state = tempfile::tempdir().expect("must create temp dir");
        let archive = state.path().join("editors.vim_1_0.zip");
        save_package_archive(&package, &archive).expect("must snapshot");

        assert!(read_backup(&archive, "$PACKAGE_DIR/vimrc")
            .expect("must read")
            .is_some());
        assert!(read_backup(&archive, "$PACKAGE_DIR/plugins/list")
            .expect("must read")
            .is_none());
    }
}
