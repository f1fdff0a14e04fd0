//! Plugin configuration (`wasmbed.toml`).
//!
//! ```toml
//! out_dir = "build/stage1"
//! mode = "inline"
//!
//! [entries]
//! feature = "crates/feature"
//!
//! [cache]
//! max_entries = 32
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wasmbed_toolchain::{BuildParams, Digest, Profile, DEFAULT_TARGET};

use crate::embed::EmbedMode;

pub const CONFIG_FILE: &str = "wasmbed.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Artifact cache bounds and locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum artifacts kept in memory.
    pub max_entries: Option<usize>,
    /// Maximum total payload bytes kept in memory.
    pub max_bytes: Option<u64>,
    /// Root for the persistent store and cargo target directories.
    pub dir: PathBuf,
    /// Keep artifacts on disk between runs.
    pub persistent: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: Some(64),
            max_bytes: None,
            dir: PathBuf::from(".wasmbed"),
            persistent: true,
        }
    }
}

/// Programs used to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
    pub cargo: PathBuf,
    pub rustc: PathBuf,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cargo: PathBuf::from("cargo"),
            rustc: PathBuf::from("rustc"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginConfig {
    /// Entry point name -> package root.
    pub entries: BTreeMap<String, PathBuf>,
    pub out_dir: PathBuf,
    /// Asset directory, relative to `out_dir`.
    pub assets_dir: String,
    pub mode: EmbedMode,
    pub target: String,
    pub profile: Profile,
    pub features: Vec<String>,
    pub no_default_features: bool,
    /// Extra arguments appended to `cargo build`.
    pub cargo_args: Vec<String>,
    pub rustflags: Vec<String>,
    /// Build time bound in seconds; 0 disables it.
    pub timeout_secs: u64,
    /// Inline requests over this size fail instead of embedding.
    pub inline_limit_bytes: Option<u64>,
    pub cache: CacheConfig,
    pub toolchain: ToolchainConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            out_dir: PathBuf::from("dist"),
            assets_dir: "assets".to_string(),
            mode: EmbedMode::External,
            target: DEFAULT_TARGET.to_string(),
            profile: Profile::Release,
            features: Vec::new(),
            no_default_features: false,
            cargo_args: Vec::new(),
            rustflags: Vec::new(),
            timeout_secs: 300,
            inline_limit_bytes: None,
            cache: CacheConfig::default(),
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl PluginConfig {
    /// Read, parse, resolve and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml(&text, base).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse TOML text, resolving relative paths against `base`.
    pub fn from_toml(text: &str, base: &Path) -> Result<Self, ConfigError> {
        let mut config: PluginConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.message().to_string(),
        })?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Make every relative path absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for root in self.entries.values_mut() {
            *root = absolutize(base, root);
        }
        self.out_dir = absolutize(base, &self.out_dir);
        self.cache.dir = absolutize(base, &self.cache.dir);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self.entries.keys() {
            if !is_valid_entry_name(name) {
                return Err(ConfigError::Invalid(format!(
                    "entry name {name:?} must be non-empty and use only [A-Za-z0-9_-]"
                )));
            }
        }
        if self.target.trim().is_empty() {
            return Err(ConfigError::Invalid("target must not be empty".to_string()));
        }
        let assets = Path::new(&self.assets_dir);
        if self.assets_dir.is_empty()
            || assets.is_absolute()
            || assets.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ConfigError::Invalid(format!(
                "assets_dir {:?} must be a plain relative path",
                self.assets_dir
            )));
        }
        if self.cache.max_entries == Some(0) {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Invocation parameters for a build with this configuration.
    pub fn build_params(&self, compiler_version: &str) -> BuildParams {
        BuildParams {
            target: self.target.clone(),
            profile: self.profile,
            features: self.features.clone(),
            no_default_features: self.no_default_features,
            cargo_args: self.cargo_args.clone(),
            rustflags: self.rustflags.clone(),
            embed_mode: self.mode.as_str().to_string(),
            compiler_version: compiler_version.to_string(),
        }
    }

    /// Directory of the persistent artifact store.
    pub fn store_dir(&self) -> PathBuf {
        self.cache.dir.join("store")
    }

    /// Cargo target directory for one package root. Each root gets its own
    /// so builds of different packages never contend.
    pub fn target_dir_for(&self, package_root: &Path) -> PathBuf {
        let key = Digest::compute(package_root.to_string_lossy().as_bytes()).short(16);
        self.cache.dir.join("target").join(key)
    }
}

/// Entry names become module ids and file names.
pub fn is_valid_entry_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
