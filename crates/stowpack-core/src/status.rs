use anyhow::{anyhow, Result};

/// Lifecycle state of a package within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    NotInstalled,
    Marked,
    Prepared,
    Installed,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInstalled => "NOT_INSTALLED",
            Self::Marked => "MARKED",
            Self::Prepared => "PREPARED",
            Self::Installed => "INSTALLED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "NOT_INSTALLED" => Some(Self::NotInstalled),
            "MARKED" => Some(Self::Marked),
            "PREPARED" => Some(Self::Prepared),
            "INSTALLED" => Some(Self::Installed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

pub(crate) fn require_status(current: Status, required: &[Status]) -> Result<()> {
    if required.contains(&current) {
        return Ok(());
    }

    let wanted = required
        .iter()
        .map(|status| status.as_str())
        .collect::<Vec<_>>()
        .join(" or ");
    Err(anyhow!(
        "package action is invalid in status {}, as {} is required",
        current.as_str(),
        wanted
    ))
}
