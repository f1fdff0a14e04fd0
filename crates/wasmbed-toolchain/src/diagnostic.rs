//! Normalized compiler diagnostic records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity level reported by the compiler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Help,
    Note,
    Warning,
    Error,
}

impl Severity {
    /// Map a rustc `level` string. Returns `None` for levels we do not forward
    /// (e.g. `failure-note`).
    pub fn from_rustc_level(level: &str) -> Option<Self> {
        match level {
            "error" | "error: internal compiler error" => Some(Severity::Error),
            "warning" => Some(Severity::Warning),
            "note" => Some(Severity::Note),
            "help" => Some(Severity::Help),
            _ => None,
        }
    }
}

/// Source location of a diagnostic (1-indexed line and column).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Span {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A single diagnostic emitted by one compiler invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticRecord {
    pub severity: Severity,

    /// Diagnostic/lint code (e.g. "E0425").
    pub code: Option<String>,

    pub message: String,

    /// Primary span, when the compiler reported one.
    pub span: Option<Span>,

    /// Human-readable rendering as the compiler would print it.
    pub rendered: Option<String>,

    /// Build that produced this record.
    pub build_id: Uuid,
}

impl DiagnosticRecord {
    pub fn new(severity: Severity, message: impl Into<String>, build_id: Uuid) -> Self {
        Self {
            severity,
            code: None,
            message: message.into(),
            span: None,
            rendered: None,
            build_id,
        }
    }

    /// Set file location.
    pub fn with_span(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.span = Some(Span {
            file: file.into(),
            line,
            column,
        });
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_rendered(mut self, rendered: impl Into<String>) -> Self {
        self.rendered = Some(rendered.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Help < Severity::Note);
        assert!(Severity::Note < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn test_from_rustc_level() {
        assert_eq!(Severity::from_rustc_level("error"), Some(Severity::Error));
        assert_eq!(
            Severity::from_rustc_level("error: internal compiler error"),
            Some(Severity::Error)
        );
        assert_eq!(Severity::from_rustc_level("warning"), Some(Severity::Warning));
        assert_eq!(Severity::from_rustc_level("failure-note"), None);
    }

    #[test]
    fn test_record_builder() {
        let record = DiagnosticRecord::new(Severity::Error, "cannot find value `x`", Uuid::nil())
            .with_code("E0425")
            .with_span("src/lib.rs", 3, 5);
        assert!(record.is_error());
        assert_eq!(record.code.as_deref(), Some("E0425"));
        let span = record.span.expect("span");
        assert_eq!(span.file, "src/lib.rs");
        assert_eq!((span.line, span.column), (3, 5));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let record = DiagnosticRecord::new(Severity::Warning, "unused variable", Uuid::nil())
            .with_span("src/lib.rs", 1, 1)
            .with_rendered("warning: unused variable");
        let json = serde_json::to_string(&record).expect("serialize");
        let back: DiagnosticRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(record, back);
    }
}
