//! Superuser handling: figure out which queued packages need or can use
//! elevated access, and probe `sudo` at most once per run.

use std::collections::BTreeSet;
use std::process::Command;

use anyhow::Result;
use tracing::{debug, warn};

use stowpack_core::{Condition, ConditionProbe, PackageStore};

/// Ask `sudo` whether the user can elevate, prompting for a password if it
/// needs one. Returns false when sudo is unavailable or denies access.
pub fn check_superuser() -> bool {
    eprintln!("Testing superuser access, please enter your password if prompted.");
    let outcome = Command::new("sudo")
        .args(["-p", "[stowpack] password for %u: ", "true"])
        .status();
    match outcome {
        Ok(status) => status.success(),
        Err(error) => {
            warn!(%error, "could not run sudo");
            false
        }
    }
}

/// Live probe backing the condition store in real runs.
#[derive(Debug, Default)]
pub struct SudoProbe;

impl ConditionProbe for SudoProbe {
    fn probe(&self, condition: Condition) -> bool {
        match condition {
            Condition::Superuser => check_superuser(),
        }
    }
}

/// Which queued packages interact with superuser access.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SuperuserNeeds {
    /// Packages whose descriptor demands elevation; they fail without it.
    pub requires: BTreeSet<String>,
    /// Packages with steps gated on the superuser condition; they merely do
    /// more when elevation is available.
    pub suggests: BTreeSet<String>,
}

impl SuperuserNeeds {
    pub fn is_empty(&self) -> bool {
        self.requires.is_empty() && self.suggests.is_empty()
    }
}

/// Scan the queue for superuser involvement, so access can be probed once
/// up front instead of stalling mid-run on a password prompt.
pub fn assess_superuser_needs(
    store: &mut PackageStore,
    queue: &[String],
) -> Result<SuperuserNeeds> {
    let mut needs = SuperuserNeeds::default();
    for name in queue {
        let package = store.get_mut(name)?;
        if package.requires_superuser() {
            needs.requires.insert(name.clone());
        } else if package
            .descriptor()
            .suggests_condition(Condition::SUPERUSER_IDENTIFIER)
        {
            needs.suggests.insert(name.clone());
        }
    }
    debug!(
        requires = needs.requires.len(),
        suggests = needs.suggests.len(),
        "assessed superuser needs"
    );
    Ok(needs)
}
