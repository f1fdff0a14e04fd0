//! Diagnostics translation into the host's error/warning channel.
//!
//! Compiler records map onto two host severities: errors halt the entry
//! point, everything else is reported as a warning. A failed build always
//! yields at least one error; when no structured error survived parsing the
//! raw compiler output is forwarded as a single span-less error.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;
use wasmbed_toolchain::{BuildArtifact, BuildError, BuildFailure, DiagnosticRecord, Span};

use crate::error::WasmbedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostSeverity {
    Warning,
    Error,
}

/// A diagnostic as the host bundler sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDiagnostic {
    pub severity: HostSeverity,
    /// Entry point the diagnostic belongs to.
    pub entry: String,
    pub message: String,
    pub code: Option<String>,
    pub location: Option<Span>,
    pub build_id: Option<Uuid>,
    pub rendered: Option<String>,
}

impl HostDiagnostic {
    pub fn error(entry: &str, message: impl Into<String>) -> Self {
        Self {
            severity: HostSeverity::Error,
            entry: entry.to_string(),
            message: message.into(),
            code: None,
            location: None,
            build_id: None,
            rendered: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == HostSeverity::Error
    }
}

/// Map one compiler record.
pub fn translate_record(entry: &str, record: &DiagnosticRecord) -> HostDiagnostic {
    HostDiagnostic {
        severity: if record.is_error() {
            HostSeverity::Error
        } else {
            HostSeverity::Warning
        },
        entry: entry.to_string(),
        message: record.message.clone(),
        code: record.code.clone(),
        location: record.span.clone(),
        build_id: Some(record.build_id),
        rendered: record.rendered.clone(),
    }
}

/// Non-fatal diagnostics recorded on a successful build.
pub fn translate_warnings(entry: &str, artifact: &BuildArtifact) -> Vec<HostDiagnostic> {
    artifact
        .metadata()
        .diagnostics
        .iter()
        .map(|record| translate_record(entry, record))
        .collect()
}

/// Everything the host should see for a failed build.
pub fn translate_build_error(entry: &str, err: &BuildError) -> Vec<HostDiagnostic> {
    match err {
        BuildError::Failed(failure) => translate_failure(entry, failure),
        BuildError::Timeout { build_id, .. } => {
            let mut diag = HostDiagnostic::error(entry, err.to_string());
            diag.build_id = Some(*build_id);
            vec![diag]
        }
        BuildError::Aborted { .. } | BuildError::Probe(_) => {
            vec![HostDiagnostic::error(entry, err.to_string())]
        }
    }
}

/// Diagnostics for any error that stopped an entry point.
pub fn translate_error(entry: &str, err: &WasmbedError) -> Vec<HostDiagnostic> {
    match err {
        WasmbedError::Build(build) => translate_build_error(entry, build),
        other => vec![HostDiagnostic::error(entry, other.to_string())],
    }
}

fn translate_failure(entry: &str, failure: &BuildFailure) -> Vec<HostDiagnostic> {
    if !failure.malformed.is_empty() {
        debug!(
            entry = %entry,
            lines = failure.malformed.len(),
            "Compiler output had unparseable lines"
        );
    }

    let has_primary_error = failure
        .diagnostics
        .iter()
        .any(|d| d.is_error() && !is_summary(d));

    let mut out: Vec<HostDiagnostic> = failure
        .diagnostics
        .iter()
        .filter(|d| !(has_primary_error && is_summary(d)))
        .map(|d| translate_record(entry, d))
        .collect();

    if !out.iter().any(HostDiagnostic::is_error) {
        let stderr = failure.stderr.trim();
        let message = if stderr.is_empty() {
            failure.message.clone()
        } else {
            format!("{}\n{}", failure.message, stderr)
        };
        let mut raw = HostDiagnostic::error(entry, message);
        raw.build_id = Some(failure.build_id);
        out.push(raw);
    }
    out
}

/// rustc's closing "aborting due to N previous errors" line.
fn is_summary(record: &DiagnosticRecord) -> bool {
    record.is_error()
        && record.span.is_none()
        && (record.message.starts_with("aborting due to")
            || record.message.starts_with("could not compile"))
}

/// Ordered diagnostics for the current build pass.
#[derive(Debug, Default)]
pub struct DiagnosticsChannel {
    pending: Mutex<Vec<HostDiagnostic>>,
}

impl DiagnosticsChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, diagnostic: HostDiagnostic) {
        let location = diagnostic
            .location
            .as_ref()
            .map(|s| format!("{}:{}:{}", s.file, s.line, s.column))
            .unwrap_or_default();
        match diagnostic.severity {
            HostSeverity::Error => {
                error!(entry = %diagnostic.entry, location = %location, "{}", diagnostic.message)
            }
            HostSeverity::Warning => {
                warn!(entry = %diagnostic.entry, location = %location, "{}", diagnostic.message)
            }
        }
        self.lock().push(diagnostic);
    }

    pub fn emit_all(&self, diagnostics: impl IntoIterator<Item = HostDiagnostic>) {
        for diagnostic in diagnostics {
            self.emit(diagnostic);
        }
    }

    /// Take everything emitted since the last drain.
    pub fn drain(&self) -> Vec<HostDiagnostic> {
        std::mem::take(&mut *self.lock())
    }

    /// Take one entry's diagnostics, leaving other entries' in place.
    pub fn drain_entry(&self, entry: &str) -> Vec<HostDiagnostic> {
        let mut pending = self.lock();
        let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
            .into_iter()
            .partition(|d| d.entry == entry);
        *pending = rest;
        taken
    }

    pub fn snapshot(&self) -> Vec<HostDiagnostic> {
        self.lock().clone()
    }

    pub fn has_errors(&self, entry: &str) -> bool {
        self.lock().iter().any(|d| d.entry == entry && d.is_error())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HostDiagnostic>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
