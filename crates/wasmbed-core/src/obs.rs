//! Structured observability hooks for the build lifecycle.
//!
//! This module provides:
//! - Build-scoped tracing spans via [`build_span`]
//! - Emission functions for lifecycle events: build start/finish, cache hit
//!   and eviction, embed writes, watch invalidation
//!
//! Events are emitted at `info!` level (configurable via `RUST_LOG`).
//! For JSON output, set `WASMBED_LOG_FORMAT=json`.

use std::path::Path;

use tracing::info;
use uuid::Uuid;
use wasmbed_toolchain::Digest;

/// Span tagging every event of one entry point's resolution.
///
/// Attach with `tracing::Instrument::instrument` so it survives `.await`.
pub fn build_span(entry: &str, fingerprint: &Digest) -> tracing::Span {
    tracing::info_span!("wasmbed.build", entry = %entry, fingerprint = %fingerprint.short(16))
}

/// Emit event: a compiler invocation started.
///
/// ```ignore
/// emit_build_started(build_id, "add", &fp);
/// // logs: event=build.started build_id=... entry=add fingerprint=0123abcd...
/// ```
pub fn emit_build_started(build_id: Uuid, entry: &str, fingerprint: &Digest) {
    info!(
        event = "build.started",
        build_id = %build_id,
        entry = %entry,
        fingerprint = %fingerprint.short(16),
    );
}

/// Emit event: a compiler invocation finished.
pub fn emit_build_finished(
    build_id: Uuid,
    entry: &str,
    duration_ms: u64,
    size: Option<u64>,
    success: bool,
) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        entry = %entry,
        duration_ms = duration_ms,
        size = size.unwrap_or(0),
        success = success,
    );
}

/// Emit event: an artifact was reused without building.
pub fn emit_cache_hit(fingerprint: &Digest, persistent: bool) {
    info!(event = "cache.hit", fingerprint = %fingerprint.short(16), persistent = persistent);
}

/// Emit event: an artifact was evicted to stay within cache bounds.
pub fn emit_cache_evicted(fingerprint: &Digest, size: u64) {
    info!(event = "cache.evicted", fingerprint = %fingerprint.short(16), size = size);
}

/// Emit event: an embedded module was rendered (and its asset written).
pub fn emit_embed_written(entry: &str, mode: &str, size: u64, asset: Option<&Path>) {
    info!(
        event = "embed.written",
        entry = %entry,
        mode = %mode,
        size = size,
        asset = %asset.map(|p| p.display().to_string()).unwrap_or_default(),
    );
}

/// Emit event: a change on disk invalidated cached artifacts.
pub fn emit_watch_invalidated(path: &Path, artifacts: usize, modules: usize) {
    info!(
        event = "watch.invalidated",
        path = %path.display(),
        artifacts = artifacts,
        modules = modules,
    );
}

/// Emit event: an entry point failed (warning level).
pub fn emit_entry_failed(entry: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "entry.failed", entry = %entry, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_span_create() {
        let span = build_span("add", &Digest::compute(b"fp"));
        let _entered = span.enter();
    }
}
