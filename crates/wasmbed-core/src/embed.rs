//! Rendering artifacts into JavaScript modules.
//!
//! Inline mode carries the payload in the module text as a length-prefixed
//! base64 literal (`"<len>:<base64>"`) decoded at load time by the runtime
//! module. External mode writes the payload to a content-addressed asset next
//! to the bundle and references it by URL.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;
use wasmbed_toolchain::{BuildArtifact, Digest};

use crate::obs;

/// Specifier generated modules import the runtime from.
pub const RUNTIME_SPECIFIER: &str = "wasmbed:runtime";

/// Module id of the runtime helper.
pub const RUNTIME_ID: &str = "\0wasmbed:runtime";

/// File name of the runtime helper when modules are written out standalone.
pub const RUNTIME_FILE: &str = "wasmbed-runtime.js";

/// Hex characters of the fingerprint used in asset file names.
const ASSET_HASH_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("{entry}: artifact is {size} bytes, over the inline limit of {limit} bytes")]
    InlineLimitExceeded { entry: String, size: u64, limit: u64 },

    #[error("failed to write asset {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed inline literal: {0}")]
    Decode(String),

    #[error("asset write task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedMode {
    Inline,
    External,
}

impl EmbedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedMode::Inline => "inline",
            EmbedMode::External => "external",
        }
    }
}

impl std::fmt::Display for EmbedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(EmbedMode::Inline),
            "external" => Ok(EmbedMode::External),
            other => Err(format!("unknown embed mode {other:?} (expected inline or external)")),
        }
    }
}

/// A file written next to the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedAsset {
    /// Path relative to the output directory, `/`-separated.
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Graph-visible rendering of one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedModule {
    pub mode: EmbedMode,
    pub fingerprint: Digest,
    /// ES module source.
    pub code: String,
    /// Set for external mode.
    pub asset: Option<EmittedAsset>,
    /// URL the code references, for external mode.
    pub reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Embedder {
    out_dir: PathBuf,
    assets_dir: String,
    inline_limit: Option<u64>,
}

impl Embedder {
    pub fn new(out_dir: impl Into<PathBuf>, assets_dir: impl Into<String>) -> Self {
        Self {
            out_dir: out_dir.into(),
            assets_dir: assets_dir.into(),
            inline_limit: None,
        }
    }

    pub fn with_inline_limit(mut self, limit: Option<u64>) -> Self {
        self.inline_limit = limit;
        self
    }

    /// Render `artifact` for `entry` in `mode`.
    pub async fn embed(
        &self,
        artifact: &BuildArtifact,
        entry: &str,
        mode: EmbedMode,
    ) -> Result<EmbeddedModule, EmbedError> {
        let embedded = match mode {
            EmbedMode::Inline => self.embed_inline(artifact, entry)?,
            EmbedMode::External => self.embed_external(artifact, entry).await?,
        };
        obs::emit_embed_written(
            entry,
            mode.as_str(),
            artifact.size(),
            embedded.asset.as_ref().map(|a| a.path.as_path()),
        );
        Ok(embedded)
    }

    fn embed_inline(&self, artifact: &BuildArtifact, entry: &str) -> Result<EmbeddedModule, EmbedError> {
        if let Some(limit) = self.inline_limit {
            if artifact.size() > limit {
                return Err(EmbedError::InlineLimitExceeded {
                    entry: entry.to_string(),
                    size: artifact.size(),
                    limit,
                });
            }
        }

        let literal = encode_inline(artifact.bytes());
        let code = format!(
            "import {{ decode, instantiate as instantiateModule }} from {runtime};\n\
             const bytes = decode({literal});\n\
             export const exports = {exports};\n\
             export function instantiate(imports) {{\n  return instantiateModule(bytes, imports);\n}}\n\
             export {{ bytes }};\n\
             export default bytes;\n",
            runtime = js_string(RUNTIME_SPECIFIER),
            literal = js_string(&literal),
            exports = js_exports(artifact),
        );

        Ok(EmbeddedModule {
            mode: EmbedMode::Inline,
            fingerprint: artifact.fingerprint(),
            code,
            asset: None,
            reference: None,
        })
    }

    async fn embed_external(
        &self,
        artifact: &BuildArtifact,
        entry: &str,
    ) -> Result<EmbeddedModule, EmbedError> {
        let file_name = asset_file_name(entry, &artifact.fingerprint());
        let relative = format!("{}/{}", self.assets_dir, file_name);
        let dir = self.out_dir.join(&self.assets_dir);
        let path = dir.join(&file_name);

        let bytes = artifact.bytes().to_vec();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &bytes))
            .await
            .map_err(|e| EmbedError::Task(e.to_string()))??;
        debug!(path = %path.display(), "Wrote wasm asset");

        let reference = format!("./{relative}");
        let code = format!(
            "import {{ instantiate as instantiateModule }} from {runtime};\n\
             const url = new URL({reference}, import.meta.url).href;\n\
             export const exports = {exports};\n\
             export function instantiate(imports) {{\n  return instantiateModule(url, imports);\n}}\n\
             export {{ url }};\n\
             export default url;\n",
            runtime = js_string(RUNTIME_SPECIFIER),
            reference = js_string(&reference),
            exports = js_exports(artifact),
        );

        Ok(EmbeddedModule {
            mode: EmbedMode::External,
            fingerprint: artifact.fingerprint(),
            code,
            asset: Some(EmittedAsset {
                file_name: relative,
                path,
                size: artifact.size(),
            }),
            reference: Some(reference),
        })
    }
}

/// `<entry>-<fp16>.wasm`
pub fn asset_file_name(entry: &str, fingerprint: &Digest) -> String {
    format!("{}-{}.wasm", sanitize(entry), fingerprint.short(ASSET_HASH_LEN))
}

/// Encode bytes as `"<len>:<base64>"`.
pub fn encode_inline(bytes: &[u8]) -> String {
    format!("{}:{}", bytes.len(), STANDARD.encode(bytes))
}

/// Inverse of [`encode_inline`]; the length prefix must match.
pub fn decode_inline(literal: &str) -> Result<Vec<u8>, EmbedError> {
    let (len, payload) = literal
        .split_once(':')
        .ok_or_else(|| EmbedError::Decode("missing length prefix".to_string()))?;
    let expected: usize = len
        .parse()
        .map_err(|_| EmbedError::Decode(format!("bad length prefix {len:?}")))?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| EmbedError::Decode(e.to_string()))?;
    if bytes.len() != expected {
        return Err(EmbedError::Decode(format!(
            "length prefix says {expected} bytes, payload has {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Pull the inline literal back out of generated module code.
pub fn extract_inline_literal(code: &str) -> Option<String> {
    let start = code.find("decode(")? + "decode(".len();
    let end = code[start..].find(')')? + start;
    serde_json::from_str(&code[start..end]).ok()
}

/// Source of the runtime helper module every generated module imports.
pub fn runtime_module_source() -> &'static str {
    RUNTIME_SOURCE
}

const RUNTIME_SOURCE: &str = r#"export function decode(literal) {
  const sep = literal.indexOf(":");
  const length = Number(literal.slice(0, sep));
  const binary = atob(literal.slice(sep + 1));
  if (binary.length !== length) {
    throw new Error(`wasmbed: expected ${length} bytes, decoded ${binary.length}`);
  }
  const bytes = new Uint8Array(length);
  for (let i = 0; i < length; i++) {
    bytes[i] = binary.charCodeAt(i);
  }
  return bytes;
}

async function fetchBytes(url) {
  if (url.startsWith("file:")) {
    const { readFile } = await import("node:fs/promises");
    return readFile(new URL(url));
  }
  const response = await fetch(url);
  if (!response.ok) {
    throw new Error(`wasmbed: failed to fetch ${url}: ${response.status}`);
  }
  return new Uint8Array(await response.arrayBuffer());
}

export async function instantiate(source, imports = {}) {
  const bytes = typeof source === "string" ? await fetchBytes(source) : source;
  const { instance } = await WebAssembly.instantiate(bytes, imports);
  return instance.exports;
}
"#;

/// Point generated `code` at the runtime written as a sibling file instead
/// of the virtual runtime module.
pub fn link_runtime(code: &str) -> String {
    code.replace(
        &js_string(RUNTIME_SPECIFIER),
        &js_string(&format!("./{RUNTIME_FILE}")),
    )
}

/// Write the runtime helper into `out_dir`.
pub async fn write_runtime(out_dir: &Path) -> Result<PathBuf, EmbedError> {
    let dir = out_dir.to_path_buf();
    let path = dir.join(RUNTIME_FILE);
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_atomic(&dir, &target, RUNTIME_SOURCE.as_bytes()))
        .await
        .map_err(|e| EmbedError::Task(e.to_string()))??;
    Ok(path)
}

/// Write a standalone entry module (`<out_dir>/<entry>.js`) linked against
/// the runtime file.
pub async fn write_entry_module(
    out_dir: &Path,
    entry: &str,
    embedded: &EmbeddedModule,
) -> Result<PathBuf, EmbedError> {
    let dir = out_dir.to_path_buf();
    let path = dir.join(format!("{}.js", sanitize(entry)));
    let target = path.clone();
    let code = link_runtime(&embedded.code);
    tokio::task::spawn_blocking(move || write_atomic(&dir, &target, code.as_bytes()))
        .await
        .map_err(|e| EmbedError::Task(e.to_string()))??;
    Ok(path)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn js_exports(artifact: &BuildArtifact) -> String {
    serde_json::Value::from(artifact.exports().to_vec()).to_string()
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), EmbedError> {
    let io_err = |source| EmbedError::Write {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
