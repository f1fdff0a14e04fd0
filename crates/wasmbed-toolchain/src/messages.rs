//! Parser for `cargo build --message-format=json` output.
//!
//! Cargo writes one JSON object per line to stdout. We care about three
//! reasons: `compiler-message` (diagnostics), `compiler-artifact` (where the
//! `.wasm` landed) and `build-finished`. Lines that are not valid JSON are
//! collected as [`DiagnosticsParseError`]s instead of being dropped, so the
//! translator can fall back to raw output when nothing structured survived.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::diagnostic::{DiagnosticRecord, Severity};

/// One line of compiler output that could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("malformed compiler output on line {line}: {reason}")]
pub struct DiagnosticsParseError {
    /// 1-indexed line number in the captured stdout.
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    manifest_path: Option<PathBuf>,
    #[serde(default)]
    message: Option<CompilerMessage>,
    #[serde(default)]
    target: Option<CargoTarget>,
    #[serde(default)]
    filenames: Vec<PathBuf>,
    #[serde(default)]
    success: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CargoTarget {
    #[serde(default)]
    kind: Vec<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CompilerMessage {
    message: String,
    level: String,
    #[serde(default)]
    code: Option<DiagnosticCode>,
    #[serde(default)]
    spans: Vec<DiagnosticSpan>,
    #[serde(default)]
    rendered: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiagnosticCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct DiagnosticSpan {
    file_name: String,
    line_start: u32,
    column_start: u32,
    is_primary: bool,
}

/// A `compiler-artifact` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerArtifact {
    pub target_name: String,
    pub kinds: Vec<String>,
    pub manifest_path: Option<PathBuf>,
    pub filenames: Vec<PathBuf>,
}

impl CompilerArtifact {
    fn wasm_file(&self) -> Option<&PathBuf> {
        if !self.kinds.iter().any(|k| k == "cdylib") {
            return None;
        }
        self.filenames
            .iter()
            .find(|f| f.extension().is_some_and(|e| e == "wasm"))
    }
}

/// Everything extracted from one build's stdout.
#[derive(Debug, Default)]
pub struct CargoStream {
    pub artifacts: Vec<CompilerArtifact>,
    pub diagnostics: Vec<DiagnosticRecord>,
    pub malformed: Vec<DiagnosticsParseError>,
    /// Value of the final `build-finished` message, if one arrived.
    pub finished: Option<bool>,
}

impl CargoStream {
    /// Locate the `.wasm` produced for `manifest_path`.
    ///
    /// Falls back to the last cdylib `.wasm` in the stream when no artifact
    /// names the manifest (older cargo versions omit `manifest_path`).
    pub fn wasm_artifact(&self, manifest_path: &Path) -> Option<PathBuf> {
        let own = self
            .artifacts
            .iter()
            .filter(|a| a.manifest_path.as_deref() == Some(manifest_path))
            .find_map(CompilerArtifact::wasm_file);

        own.or_else(|| self.artifacts.iter().rev().find_map(CompilerArtifact::wasm_file))
            .cloned()
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }
}

/// Parse cargo's JSON message stream.
pub fn parse_cargo_stream(stdout: &[u8], build_id: Uuid) -> CargoStream {
    let mut stream = CargoStream::default();
    let text = String::from_utf8_lossy(stdout);

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let msg = match serde_json::from_str::<CargoMessage>(line) {
            Ok(msg) => msg,
            Err(e) => {
                stream.malformed.push(DiagnosticsParseError {
                    line: idx + 1,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        match msg.reason.as_str() {
            "compiler-message" => {
                let Some(compiler_msg) = msg.message else {
                    stream.malformed.push(DiagnosticsParseError {
                        line: idx + 1,
                        reason: "compiler-message without a message body".to_string(),
                    });
                    continue;
                };
                if let Some(record) = to_record(compiler_msg, build_id) {
                    stream.diagnostics.push(record);
                }
            }
            "compiler-artifact" => {
                if let Some(target) = msg.target {
                    stream.artifacts.push(CompilerArtifact {
                        target_name: target.name,
                        kinds: target.kind,
                        manifest_path: msg.manifest_path,
                        filenames: msg.filenames,
                    });
                }
            }
            "build-finished" => stream.finished = msg.success,
            _ => {}
        }
    }

    stream
}

fn to_record(msg: CompilerMessage, build_id: Uuid) -> Option<DiagnosticRecord> {
    let severity = Severity::from_rustc_level(&msg.level)?;

    let mut record = DiagnosticRecord::new(severity, msg.message, build_id);
    if let Some(code) = msg.code {
        record = record.with_code(code.code);
    }
    if let Some(span) = msg.spans.iter().find(|s| s.is_primary) {
        record = record.with_span(span.file_name.clone(), span.line_start, span.column_start);
    }
    if let Some(rendered) = msg.rendered {
        record = record.with_rendered(rendered);
    }
    Some(record)
}
