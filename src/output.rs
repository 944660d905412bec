use owo_colors::Stream::Stderr;
use owo_colors::{OwoColorize, Style};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use crate::diagnostic::{FileResult, Severity, ToolDiagnostic};

/// Summary statistics for a `check` run.
pub struct Summary {
    pub checked_files: usize,
    pub clean_files: usize,
    pub flagged_files: usize,
    pub total_diagnostics: usize,
    pub duration: Duration,
    pub has_tool_error: bool,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Human,
    Json,
}

/// "1 file" / "3 files". Every noun in the summary pluralizes with a
/// plain `s`.
fn count(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

/// Sub-second runs read in milliseconds, everything else in seconds with
/// one decimal.
fn format_duration(d: Duration) -> String {
    if d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Render results in human format using miette.
pub fn render_human(
    results: &[FileResult],
    summary: &Summary,
    sources: &HashMap<&str, &str>,
    stderr: &mut impl Write,
) {
    for result in results {
        if result.diagnostics.is_empty() {
            continue;
        }
        if result.tool_error {
            for diag in &result.diagnostics {
                let tool = ToolDiagnostic::error(format!("{}: {}", result.path, diag.message));
                let _ = writeln!(stderr, "{:?}", miette::Report::new(tool));
            }
            continue;
        }
        let source = sources.get(result.path.as_str()).copied().unwrap_or("");
        for diag in &result.diagnostics {
            let renderable = diag.to_renderable(&result.path, source);
            let _ = writeln!(stderr, "{:?}", miette::Report::new(renderable));
        }
    }

    let _ = writeln!(stderr);
    let duration = format_duration(summary.duration);
    if summary.flagged_files == 0 && !summary.has_tool_error {
        let msg = format!(
            "✓ {} ({})",
            if summary.checked_files == 0 {
                "No files checked".to_string()
            } else {
                format!("All {} clean", count(summary.checked_files, "file"))
            },
            duration,
        );
        let style = Style::new().green().bold();
        let _ = writeln!(
            stderr,
            "{}",
            msg.if_supports_color(Stderr, |text| text.style(style))
        );
    } else {
        let primary = format!(
            "✗ Found {} in {}",
            count(summary.total_diagnostics, "problem"),
            count(summary.flagged_files, "file"),
        );
        let style = Style::new().red().bold();
        let _ = writeln!(
            stderr,
            "{}",
            primary.if_supports_color(Stderr, |text| text.style(style))
        );
        let meta = format!(
            "  Checked {} ({duration})",
            count(summary.checked_files, "file"),
        );
        let _ = writeln!(
            stderr,
            "{}",
            meta.if_supports_color(Stderr, |text| text.dimmed())
        );
    }
}

// --- Typed JSON output structures ---

#[derive(Serialize)]
struct JsonOutput {
    version: u32,
    clean: bool,
    files: Vec<JsonFileResult>,
    summary: JsonSummary,
}

#[derive(Serialize)]
struct JsonFileResult {
    path: String,
    clean: bool,
    diagnostics: Vec<JsonDiagnostic>,
}

#[derive(Serialize)]
struct JsonDiagnostic {
    message: String,
    severity: Severity,
    line: usize,
    column: usize,
}

#[derive(Serialize)]
struct JsonSummary {
    checked_files: usize,
    clean_files: usize,
    flagged_files: usize,
    diagnostics: usize,
    duration_ms: u64,
}

/// Render results in JSON format.
pub fn render_json(results: &[FileResult], summary: &Summary, stdout: &mut impl Write) {
    let files: Vec<JsonFileResult> = results
        .iter()
        .map(|r| JsonFileResult {
            path: r.path.clone(),
            clean: r.clean,
            diagnostics: r
                .diagnostics
                .iter()
                .map(|d| JsonDiagnostic {
                    message: d.message.clone(),
                    severity: d.severity,
                    line: d.line,
                    column: d.column,
                })
                .collect(),
        })
        .collect();

    let output = JsonOutput {
        version: 1,
        clean: summary.flagged_files == 0 && !summary.has_tool_error,
        files,
        summary: JsonSummary {
            checked_files: summary.checked_files,
            clean_files: summary.clean_files,
            flagged_files: summary.flagged_files,
            diagnostics: summary.total_diagnostics,
            duration_ms: u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
        },
    };

    let json_str = serde_json::to_string_pretty(&output).unwrap();
    let _ = writeln!(stdout, "{json_str}");
}
