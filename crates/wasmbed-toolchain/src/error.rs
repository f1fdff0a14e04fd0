//! Error types for wasmbed-toolchain

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::diagnostic::DiagnosticRecord;
use crate::messages::DiagnosticsParseError;

/// Errors computing a package fingerprint.
///
/// Fatal for the resolution request that triggered them; never touches the
/// artifact cache.
#[derive(Error, Debug)]
pub enum FingerprintError {
    /// The package root does not exist or cannot be listed
    #[error("package root {} is unreadable: {source}", .path.display())]
    UnreadableRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No Cargo.toml in the package root
    #[error("no Cargo.toml found in package root {}", .0.display())]
    MissingManifest(PathBuf),

    /// Cargo.toml exists but is not a usable package manifest
    #[error("malformed manifest {}: {reason}", .path.display())]
    MalformedManifest { path: PathBuf, reason: String },

    /// A source file vanished or became unreadable mid-walk
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A build that produced no usable artifact.
///
/// Carries everything the diagnostics translator needs: the structured
/// records that could be parsed, the raw stderr for fallback reporting, and
/// any lines of compiler output that failed to parse.
#[derive(Error, Debug, Clone)]
#[error("build of {} failed: {message}", .package.display())]
pub struct BuildFailure {
    pub build_id: Uuid,
    pub package: PathBuf,
    /// `None` when the compiler never ran or was killed by a signal.
    pub exit_code: Option<i32>,
    pub message: String,
    pub diagnostics: Vec<DiagnosticRecord>,
    pub stderr: String,
    pub malformed: Vec<DiagnosticsParseError>,
}

impl BuildFailure {
    /// Failure with no compiler output at all (spawn failure, missing artifact).
    pub fn bare(build_id: Uuid, package: PathBuf, message: impl Into<String>) -> Self {
        Self {
            build_id,
            package,
            exit_code: None,
            message: message.into(),
            diagnostics: Vec::new(),
            stderr: String::new(),
            malformed: Vec::new(),
        }
    }
}

/// Errors from a toolchain invocation. None of these are ever cached.
#[derive(Error, Debug, Clone)]
pub enum BuildError {
    #[error(transparent)]
    Failed(BuildFailure),

    /// The build exceeded its time bound and was killed
    #[error("build of {} timed out after {}s", .package.display(), .timeout.as_secs())]
    Timeout {
        build_id: Uuid,
        package: PathBuf,
        timeout: Duration,
    },

    /// The detached build task panicked or was torn down by the runtime
    #[error("build task for {} aborted: {reason}", .package.display())]
    Aborted { package: PathBuf, reason: String },

    /// The compiler could not be queried for its version
    #[error("failed to probe compiler version: {0}")]
    Probe(String),
}

impl BuildError {
    pub fn build_id(&self) -> Option<Uuid> {
        match self {
            BuildError::Failed(failure) => Some(failure.build_id),
            BuildError::Timeout { build_id, .. } => Some(*build_id),
            BuildError::Aborted { .. } | BuildError::Probe(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BuildError::Timeout { .. })
    }
}
