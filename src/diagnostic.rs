use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::analysis::{PikeDiagnostic, PikeSeverity};

/// The severity of a reported problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

impl From<PikeSeverity> for Severity {
    fn from(severity: PikeSeverity) -> Self {
        match severity {
            PikeSeverity::Error => Self::Error,
            PikeSeverity::Warning => Self::Warning,
            PikeSeverity::Information => Self::Information,
            PikeSeverity::Hint => Self::Hint,
        }
    }
}

/// A problem in one checked file, 1-based position.
#[derive(Debug, Clone)]
pub struct FileDiagnostic {
    pub message: String,
    pub severity: Severity,
    pub line: usize,
    pub column: usize,
}

impl FileDiagnostic {
    pub fn from_pike(diag: &PikeDiagnostic) -> Self {
        Self {
            message: diag.message.clone(),
            severity: diag.severity.into(),
            line: diag.line.max(1) as usize,
            column: diag.column.max(1) as usize,
        }
    }

    /// Convert to a miette-renderable diagnostic.
    ///
    /// The span covers the identifier at the position when one is there; a
    /// zero-length span at offset 0 keeps the "╭─[filename:1:1]" header for
    /// problems without a usable location.
    pub fn to_renderable(&self, file_path: &str, source: &str) -> RenderableDiagnostic {
        let span = span_at(source, self.line, self.column)
            .unwrap_or_else(|| SourceSpan::new(0.into(), 0));
        RenderableDiagnostic {
            message: self.message.clone(),
            src: miette::NamedSource::new(file_path, source.to_owned()),
            span: Some(span),
            label: None,
        }
    }
}

fn span_at(source: &str, line: usize, column: usize) -> Option<SourceSpan> {
    let mut offset = 0usize;
    for (idx, text) in source.split_inclusive('\n').enumerate() {
        if idx + 1 == line {
            let content = text.strip_suffix('\n').unwrap_or(text);
            let col = (column - 1).min(content.len());
            let bytes = content.as_bytes();
            let mut end = col;
            while end < bytes.len() && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric()) {
                end += 1;
            }
            return Some(SourceSpan::new((offset + col).into(), end - col));
        }
        offset += text.len();
    }
    None
}

/// The result of checking a single file.
#[derive(Debug, Clone)]
pub struct FileResult {
    pub path: String,
    pub clean: bool,
    pub diagnostics: Vec<FileDiagnostic>,
    /// True when this result represents a tool failure (exit code 2) rather
    /// than diagnostics in the file (exit code 1).
    pub tool_error: bool,
}

impl FileResult {
    pub fn clean(path: &str) -> Self {
        Self {
            path: path.to_string(),
            clean: true,
            diagnostics: vec![],
            tool_error: false,
        }
    }

    pub fn flagged(path: &str, diagnostics: Vec<FileDiagnostic>) -> Self {
        let clean = diagnostics.iter().all(|d| d.severity != Severity::Error);
        Self {
            path: path.to_string(),
            clean,
            diagnostics,
            tool_error: false,
        }
    }

    pub fn tool_error(path: &str, message: String) -> Self {
        Self {
            path: path.to_string(),
            clean: false,
            diagnostics: vec![FileDiagnostic {
                message,
                severity: Severity::Error,
                line: 1,
                column: 1,
            }],
            tool_error: true,
        }
    }
}

/// Miette-compatible error for rendering rich diagnostics.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RenderableDiagnostic {
    pub message: String,
    pub src: miette::NamedSource<String>,
    pub span: Option<SourceSpan>,
    pub label: Option<String>,
}

impl Diagnostic for RenderableDiagnostic {
    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&self.src)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        self.span.map(|span| {
            Box::new(std::iter::once(miette::LabeledSpan::new(
                self.label.clone(),
                span.offset(),
                span.len(),
            ))) as Box<dyn Iterator<Item = miette::LabeledSpan>>
        })
    }
}

/// A lightweight diagnostic for tool-level errors/warnings without source
/// code attached.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ToolDiagnostic {
    message: String,
    severity: miette::Severity,
}

impl ToolDiagnostic {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            severity: miette::Severity::Error,
        }
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            severity: miette::Severity::Warning,
        }
    }
}

impl Diagnostic for ToolDiagnostic {
    fn severity(&self) -> Option<miette::Severity> {
        Some(self.severity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_covers_identifier() {
        let source = "int main() {\n  oops();\n}\n";
        let span = span_at(source, 2, 3).unwrap();
        assert_eq!(span.offset(), 15);
        assert_eq!(span.len(), 4);
    }

    #[test]
    fn flagged_with_only_warnings_is_clean() {
        let warning = FileDiagnostic {
            message: "unused variable".into(),
            severity: Severity::Warning,
            line: 1,
            column: 1,
        };
        assert!(FileResult::flagged("a.pike", vec![warning]).clean);

        let error = FileDiagnostic {
            message: "syntax error".into(),
            severity: Severity::Error,
            line: 1,
            column: 1,
        };
        assert!(!FileResult::flagged("a.pike", vec![error]).clean);
    }
}
