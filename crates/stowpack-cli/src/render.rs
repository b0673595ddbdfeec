//! Console rendering helpers: the package table and per-package outcome
//! lines, with optional ANSI styling.

use anstyle::{AnsiColor, Effects, Style};

use stowpack_engine::{Outcome, PackageReport};

/// Tag shown in the source column for packages known only from the user's
/// installed state.
pub const INSTALLED_TAG: &str = "INSTALLED";

pub struct PackageRow {
    pub source: String,
    pub name: String,
    pub description: String,
}

fn name_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn installed_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightGreen.into()))
}

fn failure_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightRed.into()))
        .effects(Effects::BOLD)
}

fn success_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightGreen.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn pad(text: &str, width: usize) -> String {
    format!("{text:<width$}")
}

/// Format the package listing as aligned columns. Styling is separate from
/// padding so the escape sequences do not skew the column widths.
pub fn format_package_table(rows: &[PackageRow], styled: bool) -> Vec<String> {
    if rows.is_empty() {
        return vec!["No packages found.".to_string()];
    }

    let source_width = rows
        .iter()
        .map(|row| row.source.len())
        .chain(["SOURCE".len()])
        .max()
        .unwrap_or(0);
    let name_width = rows
        .iter()
        .map(|row| row.name.len())
        .chain(["PACKAGE".len()])
        .max()
        .unwrap_or(0);

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(format!(
        "{}  {}  {}",
        pad("SOURCE", source_width),
        pad("PACKAGE", name_width),
        "DESCRIPTION"
    ));

    for row in rows {
        let source = pad(&row.source, source_width);
        let source = if styled && row.source == INSTALLED_TAG {
            colorize(installed_style(), &source)
        } else {
            source
        };
        let name = pad(&row.name, name_width);
        let name = if styled {
            colorize(name_style(), &name)
        } else {
            name
        };
        lines.push(format!("{source}  {name}  {}", row.description));
    }
    lines
}

/// One line per processed package, summarizing what happened to it.
pub fn format_report_line(report: &PackageReport, styled: bool) -> String {
    let (label, style, detail) = match &report.outcome {
        Outcome::Installed => ("installed", success_style(), None),
        Outcome::Uninstalled => ("uninstalled", success_style(), None),
        Outcome::WouldInstall => ("would install", success_style(), None),
        Outcome::WouldUninstall => ("would uninstall", success_style(), None),
        Outcome::Failed(reason) => ("FAILED", failure_style(), Some(reason.clone())),
        Outcome::DependencyFailed(dependency) => (
            "SKIPPED",
            failure_style(),
            Some(format!("dependency '{dependency}' failed")),
        ),
    };

    let label = if styled {
        colorize(style, label)
    } else {
        label.to_string()
    };
    match detail {
        Some(detail) => format!("{label}: {} ({detail})", report.name),
        None => format!("{label}: {}", report.name),
    }
}
