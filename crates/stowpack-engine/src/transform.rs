//! Step transformers: rewrite declared steps before execution.
//!
//! Each transformer can rewrite a step into one or more replacement steps.
//! Per-step overrides live under the `$transform` meta key; a transformer
//! consumes its own override when it runs. After the chain a validation pass
//! strips overrides of explicitly disabled transformers and refuses any
//! leftover override, which would mean the descriptor asked for a
//! transformation this run cannot perform.

use anyhow::{bail, Result};
use serde_yaml::Mapping;
use tracing::debug;

use stowpack_core::{ActionRecord, Stage};

use crate::fsops;

fn enabled_in(cfg: &Mapping) -> bool {
    cfg.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true)
}

trait Transformer {
    fn identifier(&self) -> &'static str;

    fn affects(&self, stage: Stage) -> bool;

    /// Rewrite one step, unconditionally. The pipeline has already checked
    /// the stage and the per-step override.
    fn transform(&self, cfg: &Mapping, record: ActionRecord) -> Result<Vec<ActionRecord>>;
}

pub const COPIES_AS_SYMLINKS: &str = "copies as symlinks";

/// Rewrites `copy` and `replace` steps into `symlink` steps with relative
/// targets, so a deployed file edits back into its source checkout.
struct CopiesAsSymlinks;

impl CopiesAsSymlinks {
    fn handle_copy(mut record: ActionRecord) -> Vec<ActionRecord> {
        record.set_operation("symlink");
        record.set_bool("relative", true);
        vec![record]
    }

    /// `replace` promises a backup at uninstall, so it cannot become a plain
    /// symlink. Split it: remove the current files (the symlink takes their
    /// place), then link the sources in.
    fn handle_replace(record: &ActionRecord) -> Result<Vec<ActionRecord>> {
        let at = record.str_arg("at")?;
        let prefix = record.str_arg("prefix")?;
        let with_file = record.str_arg("with_file")?;
        let with_files = record.str_list_arg("with_files")?;

        let mut remove = ActionRecord::new("remove");
        remove.set_bool("ignore_missing", true);
        if let Some(at) = &at {
            remove.set_str("where", at);
        }
        if let Some(file) = &with_file {
            remove.set_str("file", &apply_prefix(prefix.as_deref(), file));
        }
        if let Some(files) = &with_files {
            let prefixed: Vec<String> = files
                .iter()
                .map(|file| apply_prefix(prefix.as_deref(), file))
                .collect();
            remove.set_str_list("files", &prefixed);
        }

        let mut symlink = ActionRecord::new("symlink");
        symlink.set_bool("relative", true);
        if let Some(at) = &at {
            symlink.set_str("to", at);
        }
        if let Some(file) = &with_file {
            symlink.set_str("file", file);
        }
        if let Some(files) = &with_files {
            symlink.set_str_list("files", files);
        }
        if let Some(prefix) = &prefix {
            symlink.set_str("prefix", prefix);
        }

        Ok(vec![remove, symlink])
    }
}

fn apply_prefix(prefix: Option<&str>, path: &str) -> String {
    let Some(prefix) = prefix else {
        return path.to_string();
    };
    let (dir, file) = fsops::split_str(path);
    fsops::join_str(dir, &format!("{prefix}{file}"))
}

impl Transformer for CopiesAsSymlinks {
    fn identifier(&self) -> &'static str {
        COPIES_AS_SYMLINKS
    }

    fn affects(&self, stage: Stage) -> bool {
        stage == Stage::Install
    }

    fn transform(&self, _cfg: &Mapping, record: ActionRecord) -> Result<Vec<ActionRecord>> {
        let operation = record.operation()?;
        if operation != "copy" && operation != "replace" {
            return Ok(vec![record]);
        }

        // A link into the session scratch directory would dangle once the
        // run ends, so those steps stay copies.
        if record.summary().contains("$TEMPORARY_DIR") {
            return Ok(vec![record]);
        }

        if operation == "copy" {
            Ok(Self::handle_copy(record))
        } else {
            Self::handle_replace(&record)
        }
    }
}

/// The transformer chain configured for one run.
pub struct TransformerPipeline {
    transformers: Vec<(Box<dyn Transformer>, bool)>,
}

impl TransformerPipeline {
    pub fn new(copies_as_symlinks: bool) -> Self {
        Self {
            transformers: vec![(Box::new(CopiesAsSymlinks), copies_as_symlinks)],
        }
    }

    /// Run every transformer over the step list, then validate that no
    /// `$transform` override is left unconsumed.
    pub fn apply(&self, stage: Stage, steps: Vec<ActionRecord>) -> Result<Vec<ActionRecord>> {
        let mut current = steps;
        for (transformer, globally_enabled) in &self.transformers {
            let mut next = Vec::with_capacity(current.len());
            for record in current {
                if !*globally_enabled || !transformer.affects(stage) {
                    next.push(record);
                    continue;
                }
                let cfg = record.transformer_config(transformer.identifier())?;
                if !enabled_in(&cfg) {
                    next.push(record);
                    continue;
                }
                debug!(
                    transformer = transformer.identifier(),
                    step = %record.summary(),
                    "transforming step"
                );
                for mut result in transformer.transform(&cfg, record)? {
                    result.strip_transformer_config(transformer.identifier());
                    next.push(result);
                }
            }
            current = next;
        }

        for record in &mut current {
            for identifier in record.transformer_names() {
                let cfg = record.transformer_config(&identifier)?;
                if enabled_in(&cfg) {
                    bail!(
                        "transformer '{}' was configured for step '{}' in stage '{}', \
                         but this transformer was not able to execute",
                        identifier,
                        record.summary(),
                        stage.as_str()
                    );
                }
                // An explicitly disabled transformer's override is spent.
                record.strip_transformer_config(&identifier);
            }
        }

        Ok(current)
    }
}
