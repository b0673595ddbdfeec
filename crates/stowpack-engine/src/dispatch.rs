//! Shared step-dispatch plumbing: operation name validation and condition
//! gating, common to every stage executor.

use anyhow::{bail, Result};

use stowpack_core::{ActionRecord, ConditionStore};

/// Resolve the operation name of a step. Names are normalized the same way
/// as argument keys (`remove tree` and `remove_tree` are the same
/// operation); an underscore prefix is refused so descriptors cannot reach
/// executor internals.
pub(crate) fn operation_of(record: &ActionRecord) -> Result<String> {
    let name = record.operation()?;
    if name.starts_with('_') {
        bail!("invalid action '{name}' requested: do not try accessing execution engine internals");
    }
    Ok(name.replace(' ', "_"))
}

/// Evaluate the `if` / `if not` gates of a step. A gated-out step is skipped
/// and counts as successful.
///
/// A present-but-empty `if not` list always skips the step. The negative
/// gate asks "does any of these hold?", and over zero conditions nothing
/// holds, so descriptors can use `if not: []` to park a step.
pub(crate) fn should_run(record: &ActionRecord, conditions: &mut ConditionStore) -> Result<bool> {
    if record.has_arg("if") {
        let identifiers = record.positive_conditions()?;
        if !conditions.check_identifiers(&identifiers)? {
            return Ok(false);
        }
    }
    if record.has_arg("if_not") {
        let identifiers = record.negative_conditions()?;
        if identifiers.is_empty() {
            return Ok(false);
        }
        for identifier in &identifiers {
            if conditions.check_identifiers(std::slice::from_ref(identifier))? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// A required string argument.
pub(crate) fn require_str(record: &ActionRecord, operation: &str, key: &str) -> Result<String> {
    record
        .str_arg(key)?
        .ok_or_else(|| anyhow::anyhow!("'{operation}' requires the '{key}' argument"))
}

/// The `print` operation, shared by every stage: show a package-attributed
/// message to the user.
pub(crate) fn print_step(
    package: &str,
    record: &ActionRecord,
    expander: &stowpack_core::ArgumentExpander,
) -> Result<()> {
    let text = require_str(record, "print", "text")?;
    println!("MESSAGE FROM '{package}':\n\t{}", expander.expand(&text));
    Ok(())
}
