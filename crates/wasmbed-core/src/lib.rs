//! wasmbed-core: embedding compiled WebAssembly into a JavaScript bundle
//!
//! Sits between a host bundler and [`wasmbed_toolchain`]. The host resolves
//! and loads virtual modules through the [`ModuleGraphAdapter`]; the adapter
//! fingerprints the package, consults the [`ArtifactCache`], builds on a
//! miss, and renders the artifact inline or as an external asset.
//!
//! ## Key Components
//!
//! - `ModuleGraphAdapter`: resolve/load/change hooks for the host
//! - `ArtifactCache`: bounded LRU with pinning and an optional on-disk store
//! - `Embedder`: inline (base64 literal) or external (hashed asset) rendering
//! - `DiagnosticsChannel`: compiler diagnostics mapped to host errors/warnings
//! - `protocol`: line-delimited JSON-RPC for out-of-process hosts

pub mod adapter;
pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod embed;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod protocol;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use adapter::{
    entry_id, open_cache, ModuleGraphAdapter, ModuleRecord, NoopWatchHost, VirtualModuleNode,
    WatchHost,
};
pub use cache::fs::FsArtifactStore;
pub use cache::{ArtifactCache, ArtifactStore, CacheError, CacheLimits, CacheStats};
pub use config::{PluginConfig, CONFIG_FILE};
pub use diagnostics::{DiagnosticsChannel, HostDiagnostic, HostSeverity};
pub use embed::{EmbedError, EmbedMode, EmbeddedModule, Embedder, EmittedAsset};
pub use error::{Result, WasmbedError};

pub use wasmbed_toolchain;
