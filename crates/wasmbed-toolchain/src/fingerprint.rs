//! Source fingerprinting for Cargo packages
//!
//! Computes a content-derived identity for a package (sources, manifest, lock
//! data, local path dependencies) and folds it together with the build
//! parameters into a [`Digest`] used as the artifact cache key. Only file
//! contents and relative paths are hashed; timestamps and permissions never
//! influence the result.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::digest::{Digest, FramedHasher};
use crate::error::FingerprintError;

/// Bump when the hashing scheme changes so old cache entries stop matching.
pub const FINGERPRINT_DOMAIN: &str = "wasmbed-fingerprint-v1";

pub const MANIFEST_FILE: &str = "Cargo.toml";
pub const LOCK_FILE: &str = "Cargo.lock";

/// Directory names never descended into.
pub const IGNORED_DIRS: &[&str] = &["target", "node_modules", ".git", "dist"];

/// Generated artifacts excluded from the source set to avoid feedback loops.
const IGNORED_EXTENSIONS: &[&str] = &["wasm"];

/// Cargo build profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Dev,
    #[default]
    Release,
}

impl Profile {
    /// Directory name cargo uses under `target/<triple>/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Profile::Dev => "debug",
            Profile::Release => "release",
        }
    }
}

/// One hashed file, path relative to its package root with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub path: String,
    pub hash: Digest,
}

/// Identity of a local `path = "..."` dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyIdentity {
    pub name: String,
    pub root: PathBuf,
    pub manifest: Digest,
    pub files: Vec<SourceEntry>,
}

/// Content identity of one package feeding one entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageIdentity {
    pub root: PathBuf,
    pub package_name: String,
    pub files: Vec<SourceEntry>,
    pub manifest: Digest,
    pub lock: Option<Digest>,
    pub dependencies: Vec<DependencyIdentity>,
}

impl PackageIdentity {
    /// Digest over the whole identity.
    pub fn digest(&self) -> Digest {
        let mut hasher = FramedHasher::new(FINGERPRINT_DOMAIN);
        hasher.field(self.root.to_string_lossy().as_bytes());
        hasher.field(self.package_name.as_bytes());
        hasher.digest(&self.manifest);
        match &self.lock {
            Some(lock) => hasher.field(b"lock").digest(lock),
            None => hasher.field(b"no-lock"),
        };
        hash_entries(&mut hasher, &self.files);
        for dep in &self.dependencies {
            hasher.field(dep.name.as_bytes());
            hasher.field(dep.root.to_string_lossy().as_bytes());
            hasher.digest(&dep.manifest);
            hash_entries(&mut hasher, &dep.files);
        }
        hasher.finish()
    }

    /// Roots whose edits must invalidate artifacts built from this identity.
    pub fn watched_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.root.clone()];
        roots.extend(self.dependencies.iter().map(|d| d.root.clone()));
        roots
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }
}

fn hash_entries(hasher: &mut FramedHasher, entries: &[SourceEntry]) {
    hasher.field(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        hasher.field(entry.path.as_bytes());
        hasher.digest(&entry.hash);
    }
}

/// Compiler invocation parameters that affect the produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParams {
    pub target: String,
    pub profile: Profile,
    pub features: Vec<String>,
    pub no_default_features: bool,
    pub cargo_args: Vec<String>,
    pub rustflags: Vec<String>,
    /// Opaque tag for how the host will embed the artifact.
    pub embed_mode: String,
    /// Output of `rustc -vV`; a toolchain upgrade must never reuse artifacts.
    pub compiler_version: String,
}

impl BuildParams {
    fn canonical_features(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self.features.iter().map(String::as_str).collect();
        set.into_iter().collect()
    }
}

/// Fold a package identity and build parameters into the cache key.
pub fn fingerprint(identity: &PackageIdentity, params: &BuildParams) -> Digest {
    let mut hasher = FramedHasher::new(FINGERPRINT_DOMAIN);
    hasher.digest(&identity.digest());
    hasher.field(params.target.as_bytes());
    hasher.field(params.profile.dir_name().as_bytes());

    let features = params.canonical_features();
    hasher.field(&(features.len() as u64).to_le_bytes());
    for feature in features {
        hasher.field(feature.as_bytes());
    }
    hasher.field(&[params.no_default_features as u8]);

    hasher.field(&(params.cargo_args.len() as u64).to_le_bytes());
    for arg in &params.cargo_args {
        hasher.field(arg.as_bytes());
    }
    hasher.field(&(params.rustflags.len() as u64).to_le_bytes());
    for flag in &params.rustflags {
        hasher.field(flag.as_bytes());
    }
    hasher.field(params.embed_mode.as_bytes());
    hasher.field(params.compiler_version.as_bytes());
    hasher.finish()
}

/// Scan a package root into a [`PackageIdentity`].
///
/// Blocking; call from `spawn_blocking` inside async code.
pub fn scan_package(root: &Path) -> Result<PackageIdentity, FingerprintError> {
    let root = std::fs::canonicalize(root).map_err(|source| FingerprintError::UnreadableRoot {
        path: root.to_path_buf(),
        source,
    })?;

    let (manifest, package_name, dep_paths) = read_manifest(&root)?;
    let files = hash_tree(&root)?;
    let lock = find_lock(&root)?;

    let mut visited = BTreeSet::new();
    visited.insert(root.clone());
    let mut dependencies = Vec::new();
    collect_path_dependencies(&root, dep_paths, &mut visited, &mut dependencies)?;
    dependencies.sort_by(|a, b| (&a.name, &a.root).cmp(&(&b.name, &b.root)));

    debug!(
        root = %root.display(),
        files = files.len(),
        dependencies = dependencies.len(),
        "Scanned package"
    );

    Ok(PackageIdentity {
        root,
        package_name,
        files,
        manifest,
        lock,
        dependencies,
    })
}

/// Scan a package and compute its fingerprint in one step.
pub fn fingerprint_package(
    root: &Path,
    params: &BuildParams,
) -> Result<(PackageIdentity, Digest), FingerprintError> {
    let identity = scan_package(root)?;
    let digest = fingerprint(&identity, params);
    Ok((identity, digest))
}

/// Parse and hash `Cargo.toml`, returning the digest, package name and the
/// `(name, path)` pairs of local path dependencies.
fn read_manifest(root: &Path) -> Result<(Digest, String, Vec<(String, PathBuf)>), FingerprintError> {
    let path = root.join(MANIFEST_FILE);
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FingerprintError::MissingManifest(root.to_path_buf()))
        }
        Err(source) => return Err(FingerprintError::Io { path, source }),
    };

    let malformed = |reason: String| FingerprintError::MalformedManifest {
        path: path.clone(),
        reason,
    };

    let text = std::str::from_utf8(&content).map_err(|e| malformed(e.to_string()))?;
    let table: toml::Table = text.parse().map_err(|e: toml::de::Error| malformed(e.message().to_string()))?;

    let package = table
        .get("package")
        .and_then(toml::Value::as_table)
        .ok_or_else(|| malformed("missing [package] table".to_string()))?;
    let name = package
        .get("name")
        .and_then(toml::Value::as_str)
        .ok_or_else(|| malformed("[package] has no name".to_string()))?
        .to_string();

    let mut deps = Vec::new();
    collect_dep_tables(&table, root, &mut deps);
    if let Some(targets) = table.get("target").and_then(toml::Value::as_table) {
        for cfg in targets.values().filter_map(toml::Value::as_table) {
            collect_dep_tables(cfg, root, &mut deps);
        }
    }

    Ok((Digest::compute(&content), name, deps))
}

fn collect_dep_tables(table: &toml::Table, root: &Path, out: &mut Vec<(String, PathBuf)>) {
    for key in ["dependencies", "build-dependencies"] {
        let Some(deps) = table.get(key).and_then(toml::Value::as_table) else {
            continue;
        };
        for (name, spec) in deps {
            if let Some(path) = spec
                .as_table()
                .and_then(|t| t.get("path"))
                .and_then(toml::Value::as_str)
            {
                out.push((name.clone(), root.join(path)));
            }
        }
    }
}

fn collect_path_dependencies(
    from: &Path,
    deps: Vec<(String, PathBuf)>,
    visited: &mut BTreeSet<PathBuf>,
    out: &mut Vec<DependencyIdentity>,
) -> Result<(), FingerprintError> {
    for (name, path) in deps {
        let dep_root = std::fs::canonicalize(&path).map_err(|source| {
            FingerprintError::UnreadableRoot {
                path: path.clone(),
                source,
            }
        })?;
        if !visited.insert(dep_root.clone()) {
            continue;
        }

        debug!(from = %from.display(), dependency = %name, "Following path dependency");
        let (manifest, _, nested) = read_manifest(&dep_root)?;
        let files = hash_tree(&dep_root)?;
        out.push(DependencyIdentity {
            name,
            root: dep_root.clone(),
            manifest,
            files,
        });
        collect_path_dependencies(&dep_root, nested, visited, out)?;
    }
    Ok(())
}

/// Nearest `Cargo.lock`, searching from the package root upward.
fn find_lock(root: &Path) -> Result<Option<Digest>, FingerprintError> {
    for dir in root.ancestors() {
        let candidate = dir.join(LOCK_FILE);
        match std::fs::read(&candidate) {
            Ok(content) => return Ok(Some(Digest::compute(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(FingerprintError::Io {
                    path: candidate,
                    source,
                })
            }
        }
    }
    Ok(None)
}

/// Hash every source file under `root`, sorted by relative path.
fn hash_tree(root: &Path) -> Result<Vec<SourceEntry>, FingerprintError> {
    let mut paths = Vec::new();
    collect_source_paths(root, root, &mut paths)?;
    paths.sort();

    let mut entries = Vec::with_capacity(paths.len());
    for rel in paths {
        let full = root.join(&rel);
        let content = std::fs::read(&full).map_err(|source| FingerprintError::Io {
            path: full.clone(),
            source,
        })?;
        entries.push(SourceEntry {
            path: rel,
            hash: Digest::compute(&content),
        });
    }
    Ok(entries)
}

fn collect_source_paths(
    root: &Path,
    dir: &Path,
    out: &mut Vec<String>,
) -> Result<(), FingerprintError> {
    let read_dir = std::fs::read_dir(dir).map_err(|source| {
        if dir == root {
            FingerprintError::UnreadableRoot {
                path: dir.to_path_buf(),
                source,
            }
        } else {
            FingerprintError::Io {
                path: dir.to_path_buf(),
                source,
            }
        }
    })?;

    for entry in read_dir {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        let path = entry.path();

        if file_type.is_dir() {
            if IGNORED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            // .cargo/config.toml changes codegen, other dot-dirs are editor noise
            if name.starts_with('.') && name != ".cargo" {
                continue;
            }
            collect_source_paths(root, &path, out)?;
        } else if file_type.is_file() {
            if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| IGNORED_EXTENSIONS.contains(&ext))
            {
                continue;
            }
            // Manifest and lock are hashed separately
            if dir == root && (name == MANIFEST_FILE || name == LOCK_FILE) {
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }

    Ok(())
}
