//! Compiled WebAssembly artifacts and their interface surface.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diagnostic::DiagnosticRecord;
use crate::digest::Digest;

/// A function/memory/table/global a module exposes or expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRef {
    pub module: String,
    pub name: String,
}

/// Interface surface extracted from a module's export and import sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSurface {
    pub exports: Vec<String>,
    pub imports: Vec<ImportRef>,
}

/// Parse a WebAssembly binary and collect its exports and imports.
///
/// Fails if the payload is not a well-formed module.
pub fn inspect_module(bytes: &[u8]) -> Result<ModuleSurface, wasmparser::BinaryReaderError> {
    let mut surface = ModuleSurface::default();

    for payload in wasmparser::Parser::new(0).parse_all(bytes) {
        match payload? {
            wasmparser::Payload::ExportSection(reader) => {
                for export in reader {
                    surface.exports.push(export?.name.to_string());
                }
            }
            wasmparser::Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import?;
                    surface.imports.push(ImportRef {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    Ok(surface)
}

/// Metadata recorded alongside a compiled payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub fingerprint: Digest,
    pub package_name: String,
    pub package_root: PathBuf,
    /// Package root plus the roots of local path dependencies.
    pub watched_roots: Vec<PathBuf>,
    pub size: u64,
    pub surface: ModuleSurface,
    pub build_id: Uuid,
    pub duration_ms: u64,
    pub built_at: DateTime<Utc>,
    /// Warnings (and other non-fatal records) the build emitted.
    pub diagnostics: Vec<DiagnosticRecord>,
}

/// A successfully compiled module. Immutable once constructed; shared as
/// `Arc<BuildArtifact>`.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildArtifact {
    bytes: Vec<u8>,
    metadata: ArtifactMetadata,
}

impl BuildArtifact {
    pub fn new(bytes: Vec<u8>, metadata: ArtifactMetadata) -> Self {
        Self { bytes, metadata }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    pub fn fingerprint(&self) -> Digest {
        self.metadata.fingerprint
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn exports(&self) -> &[String] {
        &self.metadata.surface.exports
    }

    /// True if `path` is inside any root this artifact was built from.
    pub fn depends_on(&self, path: &std::path::Path) -> bool {
        self.metadata
            .watched_roots
            .iter()
            .any(|root| path.starts_with(root) || root.starts_with(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::wasm_module;

    fn metadata(roots: Vec<PathBuf>) -> ArtifactMetadata {
        ArtifactMetadata {
            fingerprint: Digest::compute(b"fp"),
            package_name: "add".to_string(),
            package_root: roots[0].clone(),
            watched_roots: roots,
            size: 0,
            surface: ModuleSurface::default(),
            build_id: Uuid::nil(),
            duration_ms: 0,
            built_at: Utc::now(),
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn inspect_collects_exports() {
        let bytes = wasm_module(&["add", "sub"], b"");
        let surface = inspect_module(&bytes).expect("valid module");
        assert_eq!(surface.exports, vec!["add".to_string(), "sub".to_string()]);
        assert!(surface.imports.is_empty());
    }

    #[test]
    fn inspect_rejects_garbage() {
        assert!(inspect_module(b"definitely not wasm").is_err());
    }

    #[test]
    fn depends_on_matches_nested_paths() {
        let artifact = BuildArtifact::new(
            Vec::new(),
            metadata(vec![PathBuf::from("/w/add"), PathBuf::from("/w/util")]),
        );
        assert!(artifact.depends_on(std::path::Path::new("/w/add/src/lib.rs")));
        assert!(artifact.depends_on(std::path::Path::new("/w/util")));
        assert!(artifact.depends_on(std::path::Path::new("/w")));
        assert!(!artifact.depends_on(std::path::Path::new("/w/other/src/lib.rs")));
    }
}
