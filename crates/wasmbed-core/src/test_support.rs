use std::path::PathBuf;

use chrono::Utc;
use uuid::Uuid;
use wasmbed_toolchain::fakes::wasm_module;
use wasmbed_toolchain::{inspect_module, ArtifactMetadata, BuildArtifact, Digest};

/// Artifact for a package under `/fake/<name>`; `seed` drives both the
/// payload and the fingerprint.
pub fn artifact(name: &str, seed: &[u8]) -> BuildArtifact {
    artifact_at(&format!("/fake/{name}"), seed)
}

pub fn artifact_at(root: &str, seed: &[u8]) -> BuildArtifact {
    let root = PathBuf::from(root);
    let bytes = wasm_module(&["add"], seed);
    let surface = inspect_module(&bytes).expect("fake module is valid");
    let metadata = ArtifactMetadata {
        fingerprint: Digest::compute(seed),
        package_name: root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        package_root: root.clone(),
        watched_roots: vec![root],
        size: bytes.len() as u64,
        surface,
        build_id: Uuid::new_v4(),
        duration_ms: 1,
        built_at: Utc::now(),
        diagnostics: Vec::new(),
    };
    BuildArtifact::new(bytes, metadata)
}
