//! Structured tracing events for the build lifecycle.
//!
//! `#[traced_test]` installs a capturing subscriber; these tests make sure
//! every event and span helper fires without panicking under it.

use std::path::Path;
use std::sync::Arc;

use tracing_test::traced_test;
use uuid::Uuid;
use wasmbed_core::obs::{
    build_span, emit_build_finished, emit_build_started, emit_cache_evicted, emit_cache_hit,
    emit_embed_written, emit_entry_failed, emit_watch_invalidated,
};
use wasmbed_core::wasmbed_toolchain::fakes::ScriptedToolchain;
use wasmbed_core::wasmbed_toolchain::Digest;
use wasmbed_core::{
    ArtifactCache, CacheLimits, EmbedMode, ModuleGraphAdapter, NoopWatchHost, PluginConfig,
    WasmbedError,
};

#[traced_test]
#[test]
fn test_emit_build_lifecycle() {
    let fp = Digest::compute(b"add");
    emit_build_started(Uuid::new_v4(), "add", &fp);
    emit_build_finished(Uuid::new_v4(), "add", 1200, Some(4096), true);
    emit_build_finished(Uuid::new_v4(), "add", 30, None, false);
}

#[traced_test]
#[test]
fn test_emit_cache_events() {
    let fp = Digest::compute(b"cached");
    emit_cache_hit(&fp, false);
    emit_cache_hit(&fp, true);
    emit_cache_evicted(&fp, 2048);
}

#[traced_test]
#[test]
fn test_emit_embed_and_watch_events() {
    emit_embed_written("add", "inline", 512, None);
    emit_embed_written("add", "external", 512, Some(Path::new("dist/assets/add-0123.wasm")));
    emit_watch_invalidated(Path::new("/w/add/src/lib.rs"), 1, 1);
}

#[traced_test]
#[test]
fn test_emit_entry_failed_is_warning() {
    let err = WasmbedError::UnknownEntry("missing".to_string());
    emit_entry_failed("missing", &err);
}

#[traced_test]
#[test]
fn test_build_span_enters() {
    let span = build_span("add", &Digest::compute(b"span"));
    let _guard = span.enter();
    tracing::info!("inside build span");
}

#[traced_test]
#[tokio::test]
async fn test_full_load_under_capturing_subscriber() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pkg = dir.path().join("add");
    std::fs::create_dir_all(pkg.join("src")).expect("mkdir");
    std::fs::write(pkg.join("Cargo.toml"), "[package]\nname = \"add\"\nversion = \"0.1.0\"\n")
        .expect("manifest");
    std::fs::write(pkg.join("src/lib.rs"), "pub fn add() {}").expect("lib");

    let mut config = PluginConfig::default();
    config.entries.insert("add".to_string(), pkg);
    config.out_dir = dir.path().join("dist");
    config.cache.persistent = false;
    config.mode = EmbedMode::External;

    let adapter = ModuleGraphAdapter::new(
        config,
        Arc::new(ArtifactCache::new(CacheLimits::default())),
        Arc::new(ScriptedToolchain::new()),
        Arc::new(NoopWatchHost),
    );
    let node = adapter.resolve_entry("add").await.expect("build");
    assert!(node.embedded.asset.is_some());
}
