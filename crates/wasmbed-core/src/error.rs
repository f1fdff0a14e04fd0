//! Top-level error taxonomy for wasmbed.

use std::path::PathBuf;
use std::sync::Arc;

use wasmbed_toolchain::{BuildError, FingerprintError};

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::embed::EmbedError;

#[derive(Debug, thiserror::Error)]
pub enum WasmbedError {
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    /// Shared with every requester that joined the same build.
    #[error(transparent)]
    Build(Arc<BuildError>),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown entry point: {0}")]
    UnknownEntry(String),

    #[error("unknown module id: {0:?}")]
    UnknownModule(String),

    #[error("entry {name} is already bound to {}", .existing.display())]
    EntryConflict { name: String, existing: PathBuf },

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<BuildError> for WasmbedError {
    fn from(err: BuildError) -> Self {
        WasmbedError::Build(Arc::new(err))
    }
}

impl WasmbedError {
    /// True for errors a later request may not hit again (builds are
    /// re-attempted, nothing was cached).
    pub fn is_build_failure(&self) -> bool {
        matches!(self, WasmbedError::Build(_))
    }
}

/// Result type for wasmbed-core operations.
pub type Result<T> = std::result::Result<T, WasmbedError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_build_error_is_transparent() {
        let err: WasmbedError = BuildError::Timeout {
            build_id: uuid::Uuid::nil(),
            package: PathBuf::from("/w/add"),
            timeout: Duration::from_secs(5),
        }
        .into();
        assert!(err.is_build_failure());
        assert!(err.to_string().contains("timed out after 5s"));
    }

    #[test]
    fn test_unknown_entry_display() {
        let err = WasmbedError::UnknownEntry("feature".to_string());
        assert_eq!(err.to_string(), "unknown entry point: feature");
    }
}
