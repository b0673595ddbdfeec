use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const SOURCE_LIST_FILE: &str = "sources.yaml";

/// One configured package source: a logical name and the directory its
/// package tree lives in. Earlier entries shadow later ones during
/// discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub directory: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SourceListFile {
    #[serde(default)]
    sources: Vec<SourceEntry>,
}

/// Package roots in priority order. Shared with the package factory, hence
/// the owned pairs.
pub type SourceMap = Vec<(String, PathBuf)>;

/// The user's ordered list of package sources, loaded from `sources.yaml`.
#[derive(Debug)]
pub struct SourceList {
    path: PathBuf,
    entries: Vec<SourceEntry>,
}

impl SourceList {
    /// Load the source list. A missing file yields an empty list with a
    /// warning; an unreadable or malformed file is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let parsed: SourceListFile = serde_yaml::from_str(&raw).with_context(|| {
                    format!("source list '{}' has invalid format", path.display())
                })?;
                parsed.sources
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no source list configured, no packages will be found");
                Vec::new()
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("could not read source list '{}'", path.display()))
            }
        };

        Ok(Self { path, entries })
    }

    pub fn save(&self) -> Result<()> {
        let data = SourceListFile {
            sources: self.entries.clone(),
        };
        let raw = serde_yaml::to_string(&data)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to save source list '{}'", self.path.display()))
    }

    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn add_source(&mut self, entry: SourceEntry) -> Result<()> {
        if self.entries.iter().any(|known| known.name == entry.name) {
            return Err(anyhow!(
                "a source entry with name '{}' already exists",
                entry.name
            ));
        }
        // New sources take priority over existing ones.
        self.entries.insert(0, entry);
        Ok(())
    }

    pub fn delete_source(&mut self, name: &str) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.name == name)
            .ok_or_else(|| anyhow!("a source entry with name '{name}' doesn't exist"))?;
        self.entries.remove(index);
        Ok(())
    }

    /// The configured package roots, in priority order.
    pub fn roots(&self) -> SourceMap {
        self.entries
            .iter()
            .map(|entry| (entry.name.clone(), entry.directory.clone()))
            .collect()
    }

    /// Like `roots`, restricted to a single named source when given.
    pub fn filter_roots(&self, only: Option<&str>) -> Result<SourceMap> {
        let roots = self.roots();
        let Some(wanted) = only else {
            return Ok(roots);
        };

        let filtered: SourceMap = roots
            .into_iter()
            .filter(|(name, _)| name == wanted)
            .collect();
        if filtered.is_empty() {
            return Err(anyhow!(
                "the specified package source '{wanted}' is not configured"
            ));
        }
        Ok(filtered)
    }
}

/// Path of the source list inside the given configuration directory.
pub fn source_list_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SOURCE_LIST_FILE)
}
