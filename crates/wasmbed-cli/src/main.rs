//! wasmbed - compile Cargo packages to WebAssembly and embed them in JS bundles
//!
//! ## Commands
//!
//! - `build`: build every entry point once and write `<out>/<entry>.js`
//! - `watch`: build, then rebuild entry points as their sources change
//! - `serve`: JSON-RPC over stdio for a host bundler plugin
//! - `fingerprint`: print the build fingerprint of a package
//! - `cache`: inspect or clear the persistent artifact cache

mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

use wasmbed_core::adapter::ENTRY_ID_PREFIX;
use wasmbed_core::embed::{write_entry_module, write_runtime};
use wasmbed_core::protocol::{self, Notification};
use wasmbed_core::telemetry::{init_tracing, LogFormat};
use wasmbed_core::{
    open_cache, ArtifactStore, EmbedMode, FsArtifactStore, HostDiagnostic, HostSeverity,
    ModuleGraphAdapter, NoopWatchHost, PluginConfig, WatchHost, CONFIG_FILE,
};
use wasmbed_toolchain::{fingerprint_package, CargoToolchain, Profile, Toolchain};

use crate::watcher::{pump_changes, WatchBridge, DEFAULT_DEBOUNCE};

#[derive(Parser)]
#[command(name = "wasmbed")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile Cargo packages to WebAssembly and embed them in JS bundles", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (optional when entries are given with --entry)
    #[arg(short, long, global = true, env = "WASMBED_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Additional entry point as NAME=PATH (repeatable)
    #[arg(short, long = "entry", global = true, value_parser = parse_entry)]
    entries: Vec<(String, PathBuf)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every entry point and write the embedding modules
    Build {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Build, then rebuild on source changes until interrupted
    Watch {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Speak line-delimited JSON-RPC on stdin/stdout
    Serve {
        #[command(flatten)]
        overrides: Overrides,

        /// Watch package sources and push `$/invalidated` notifications
        #[arg(long)]
        watch: bool,
    },

    /// Print the build fingerprint of a package
    Fingerprint {
        /// Package root (directory containing Cargo.toml)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Manage the persistent artifact cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached artifacts
    Stats,

    /// Remove cached artifacts
    Clear {
        /// Also remove cargo target directories
        #[arg(long)]
        targets: bool,
    },
}

/// Per-invocation overrides of the config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Embedding mode: inline or external
    #[arg(long)]
    mode: Option<EmbedMode>,

    /// Build with the dev profile
    #[arg(long)]
    dev: bool,

    /// Output directory
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Build timeout in seconds (0 disables)
    #[arg(long)]
    timeout: Option<u64>,
}

fn parse_entry(raw: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got {raw:?}"))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got {raw:?}"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::resolve(cli.json), level);

    let result = match cli.command {
        Commands::Build { ref overrides } => {
            let config = load_config(&cli.config, &cli.entries, overrides)?;
            cmd_build(config).await
        }
        Commands::Watch { ref overrides } => {
            let config = load_config(&cli.config, &cli.entries, overrides)?;
            cmd_watch(config).await
        }
        Commands::Serve {
            ref overrides,
            watch,
        } => {
            let config = load_config(&cli.config, &cli.entries, overrides)?;
            cmd_serve(config, watch).await
        }
        Commands::Fingerprint { ref path } => {
            let config = load_config(&cli.config, &cli.entries, &Overrides::default())?;
            cmd_fingerprint(&config, path).await
        }
        Commands::Cache { ref action } => {
            let config = load_config(&cli.config, &cli.entries, &Overrides::default())?;
            match action {
                CacheAction::Stats => cmd_cache_stats(&config),
                CacheAction::Clear { targets } => cmd_cache_clear(&config, *targets),
            }
        }
    };

    wasmbed_core::metrics::METRICS.flush();
    result
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// The config file if present, otherwise defaults relative to the working
/// directory; `--entry` and per-command flags are applied on top.
fn load_config(
    path: &Path,
    entries: &[(String, PathBuf)],
    overrides: &Overrides,
) -> Result<PluginConfig> {
    let cwd = std::env::current_dir().context("Failed to read working directory")?;

    let mut config = if path.exists() {
        PluginConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        if path != Path::new(CONFIG_FILE) {
            bail!("Config file not found: {}", path.display());
        }
        PluginConfig::default()
    };

    for (name, root) in entries {
        config.entries.insert(name.clone(), root.clone());
    }
    if let Some(mode) = overrides.mode {
        config.mode = mode;
    }
    if overrides.dev {
        config.profile = Profile::Dev;
    }
    if let Some(out_dir) = &overrides.out_dir {
        config.out_dir = out_dir.clone();
    }
    if let Some(timeout) = overrides.timeout {
        config.timeout_secs = timeout;
    }

    // Anything still relative came from the command line or the defaults.
    config.resolve_paths(&cwd);
    config.validate()?;
    Ok(config)
}

fn require_entries(config: &PluginConfig) -> Result<()> {
    if config.entries.is_empty() {
        bail!("No entry points configured; add [entries] to {CONFIG_FILE} or pass --entry NAME=PATH");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// build / watch
// ---------------------------------------------------------------------------

async fn cmd_build(config: PluginConfig) -> Result<()> {
    require_entries(&config)?;
    let adapter = ModuleGraphAdapter::from_config(config, Arc::new(NoopWatchHost))?;

    let names = adapter.entry_names();
    let failed = build_and_write(&adapter, &names).await?;
    print_diagnostics(&adapter.diagnostics().drain());

    if failed > 0 {
        bail!("{failed} of {} entry point(s) failed to build", names.len());
    }
    Ok(())
}

async fn cmd_watch(config: PluginConfig) -> Result<()> {
    require_entries(&config)?;
    let ignored = vec![config.out_dir.clone(), config.cache.dir.clone()];
    let (bridge, raw_rx) = WatchBridge::new()?;
    let host: Arc<dyn WatchHost> = bridge;
    let adapter = Arc::new(ModuleGraphAdapter::from_config(config, host)?);

    let names = adapter.entry_names();
    build_and_write(&adapter, &names).await?;
    print_diagnostics(&adapter.diagnostics().drain());

    let (ids_tx, mut ids_rx) = mpsc::channel(16);
    let pump = tokio::spawn(pump_changes(
        Arc::clone(&adapter),
        raw_rx,
        DEFAULT_DEBOUNCE,
        ignored,
        ids_tx,
    ));
    info!("Watching for changes (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ids = ids_rx.recv() => {
                let Some(ids) = ids else { break };
                let names: Vec<String> = ids
                    .iter()
                    .filter_map(|id| id.strip_prefix(ENTRY_ID_PREFIX))
                    .map(str::to_string)
                    .collect();
                if let Err(e) = build_and_write(&adapter, &names).await {
                    warn!(error = %e, "Rebuild failed");
                }
                print_diagnostics(&adapter.diagnostics().drain());
            }
        }
    }

    pump.abort();
    Ok(())
}

/// Resolve `names` concurrently and write each module next to the runtime.
/// Returns the number of entry points that failed to build or write; their
/// diagnostics are left in the adapter's channel.
async fn build_and_write(adapter: &ModuleGraphAdapter, names: &[String]) -> Result<usize> {
    let out_dir = adapter.config().out_dir.clone();
    write_runtime(&out_dir)
        .await
        .with_context(|| format!("Failed to write runtime into {}", out_dir.display()))?;

    let mut failed = 0;
    for (name, result) in adapter.build_entries(names).await {
        let node = match result {
            Ok(node) => node,
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        match write_entry_module(&out_dir, &name, &node.embedded).await {
            Ok(path) => println!(
                "{name} -> {} ({} bytes, {}, {})",
                path.display(),
                node.artifact().size(),
                node.embedded.mode,
                node.fingerprint().short(12),
            ),
            Err(e) => {
                warn!(entry = %name, error = %e, "Failed to write entry module");
                adapter
                    .diagnostics()
                    .emit(HostDiagnostic::error(&name, e.to_string()));
                failed += 1;
            }
        }
    }
    Ok(failed)
}

fn print_diagnostics(diagnostics: &[HostDiagnostic]) {
    for diag in diagnostics {
        let label = match diag.severity {
            HostSeverity::Error => "error",
            HostSeverity::Warning => "warning",
        };
        match &diag.rendered {
            Some(rendered) => eprintln!("[{}] {}", diag.entry, rendered.trim_end()),
            None => {
                let code = diag
                    .code
                    .as_ref()
                    .map(|c| format!("[{c}]"))
                    .unwrap_or_default();
                eprintln!("[{}] {label}{code}: {}", diag.entry, diag.message);
                if let Some(span) = &diag.location {
                    eprintln!("  --> {}:{}:{}", span.file, span.line, span.column);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn cmd_serve(config: PluginConfig, watch: bool) -> Result<()> {
    let ignored = vec![config.out_dir.clone(), config.cache.dir.clone()];
    let (host, raw_rx): (Arc<dyn WatchHost>, _) = if watch {
        let (bridge, raw_rx) = WatchBridge::new()?;
        (bridge as Arc<dyn WatchHost>, Some(raw_rx))
    } else {
        (Arc::new(NoopWatchHost) as Arc<dyn WatchHost>, None)
    };
    let adapter = Arc::new(ModuleGraphAdapter::from_config(config, host)?);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut background = Vec::new();
    if let Some(raw_rx) = raw_rx {
        let (ids_tx, mut ids_rx) = mpsc::channel(16);
        background.push(tokio::spawn(pump_changes(
            Arc::clone(&adapter),
            raw_rx,
            DEFAULT_DEBOUNCE,
            ignored,
            ids_tx,
        )));
        let notify_tx = out_tx.clone();
        background.push(tokio::spawn(async move {
            while let Some(ids) = ids_rx.recv().await {
                match serde_json::to_string(&Notification::invalidated(&ids)) {
                    Ok(line) => {
                        if notify_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode notification"),
                }
            }
        }));
    }

    info!("Serving JSON-RPC on stdio");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let adapter = Arc::clone(&adapter);
        let out_tx = out_tx.clone();
        // Requests run concurrently; responses are matched by id.
        tokio::spawn(async move {
            let response = protocol::handle_line(&adapter, &line).await;
            match serde_json::to_string(&response) {
                Ok(encoded) => {
                    let _ = out_tx.send(encoded);
                }
                Err(e) => warn!(error = %e, "Failed to encode response"),
            }
        });
    }

    for task in background {
        task.abort();
    }
    drop(out_tx);
    writer.await?.context("Failed to write stdout")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// fingerprint / cache
// ---------------------------------------------------------------------------

async fn cmd_fingerprint(config: &PluginConfig, path: &Path) -> Result<()> {
    let toolchain = CargoToolchain::new(
        config.toolchain.cargo.clone(),
        config.toolchain.rustc.clone(),
    );
    let version = toolchain.version().await?;
    let params = config.build_params(&version);

    let root = path.to_path_buf();
    let (identity, digest) =
        tokio::task::spawn_blocking(move || fingerprint_package(&root, &params)).await??;

    println!("{digest}");
    println!("  package:      {}", identity.package_name);
    println!("  root:         {}", identity.root.display());
    println!("  files:        {}", identity.files.len());
    println!("  path deps:    {}", identity.dependencies.len());
    println!("  lock file:    {}", if identity.lock.is_some() { "yes" } else { "no" });
    println!("  compiler:     {}", version.lines().next().unwrap_or_default());
    println!("  target:       {} ({})", config.target, config.profile.dir_name());
    println!("  mode:         {}", config.mode);
    Ok(())
}

fn cmd_cache_stats(config: &PluginConfig) -> Result<()> {
    let store = FsArtifactStore::new(config.store_dir())?;
    let mut entries = store.list()?;
    entries.sort_by(|a, b| b.built_at.cmp(&a.built_at));

    let total: u64 = entries.iter().map(|m| m.size).sum();
    println!("{} artifact(s), {} bytes in {}", entries.len(), total, config.store_dir().display());
    for meta in &entries {
        println!(
            "  {}  {:<20} {:>10} bytes  {}",
            meta.fingerprint.short(12),
            meta.package_name,
            meta.size,
            meta.built_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn cmd_cache_clear(config: &PluginConfig, targets: bool) -> Result<()> {
    let cache = open_cache(config)?;
    let removed = cache.clear()?;
    println!("Removed {removed} cached artifact(s)");

    if targets {
        let dir = config.cache.dir.join("target");
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            println!("Removed {}", dir.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry() {
        assert_eq!(
            parse_entry("add=crates/add").unwrap(),
            ("add".to_string(), PathBuf::from("crates/add"))
        );
        assert!(parse_entry("add").is_err());
        assert!(parse_entry("=crates/add").is_err());
    }

    #[test]
    fn test_cli_parses_build_overrides() {
        let cli = Cli::try_parse_from([
            "wasmbed", "build", "--mode", "inline", "--dev", "-o", "out", "-e", "add=./add",
        ])
        .unwrap();
        match cli.command {
            Commands::Build { overrides } => {
                assert_eq!(overrides.mode, Some(EmbedMode::Inline));
                assert!(overrides.dev);
                assert_eq!(overrides.out_dir, Some(PathBuf::from("out")));
            }
            _ => panic!("expected build"),
        }
        assert_eq!(cli.entries.len(), 1);
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "mode = \"external\"\n\n[entries]\nadd = \"crates/add\"\n",
        )
        .unwrap();

        let overrides = Overrides {
            mode: Some(EmbedMode::Inline),
            dev: true,
            out_dir: None,
            timeout: Some(0),
        };
        let config = load_config(&path, &[], &overrides).unwrap();
        assert_eq!(config.mode, EmbedMode::Inline);
        assert_eq!(config.profile, Profile::Dev);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.entries["add"], dir.path().join("crates/add"));
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let err = load_config(Path::new("/nonexistent/wasmbed.toml"), &[], &Overrides::default());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_build_writes_modules_and_runtime() {
        use wasmbed_core::{ArtifactCache, CacheLimits};
        use wasmbed_toolchain::fakes::ScriptedToolchain;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("add");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("Cargo.toml"), "[package]\nname = \"add\"\nversion = \"0.1.0\"\n")
            .unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn add() {}").unwrap();

        let mut config = PluginConfig::default();
        config.entries.insert("add".to_string(), root);
        config.out_dir = dir.path().join("dist");
        config.cache.persistent = false;
        config.mode = EmbedMode::External;
        let adapter = ModuleGraphAdapter::new(
            config,
            Arc::new(ArtifactCache::new(CacheLimits::default())),
            Arc::new(ScriptedToolchain::new()),
            Arc::new(NoopWatchHost),
        );

        let failed = build_and_write(&adapter, &adapter.entry_names()).await.unwrap();
        assert_eq!(failed, 0);

        let dist = dir.path().join("dist");
        let module = std::fs::read_to_string(dist.join("add.js")).unwrap();
        assert!(module.contains("./wasmbed-runtime.js"));
        assert!(module.contains("./assets/add-"));
        assert!(dist.join("wasmbed-runtime.js").exists());
        assert_eq!(std::fs::read_dir(dist.join("assets")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_build_writes_remaining_entries_when_some_fail() {
        use wasmbed_core::{ArtifactCache, CacheLimits};
        use wasmbed_toolchain::fakes::ScriptedToolchain;

        let dir = tempfile::tempdir().unwrap();
        let mut config = PluginConfig::default();
        for name in ["add", "blocked"] {
            let root = dir.path().join(name);
            std::fs::create_dir_all(root.join("src")).unwrap();
            std::fs::write(
                root.join("Cargo.toml"),
                format!("[package]\nname = \"{name}\"\nversion = \"0.1.0\"\n"),
            )
            .unwrap();
            std::fs::write(root.join("src/lib.rs"), "pub fn f() {}").unwrap();
            config.entries.insert(name.to_string(), root);
        }
        // No manifest: fingerprinting fails.
        let broken = dir.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        config.entries.insert("broken".to_string(), broken);

        let dist = dir.path().join("dist");
        // A non-empty directory where blocked.js should go: the write fails.
        std::fs::create_dir_all(dist.join("blocked.js")).unwrap();
        std::fs::write(dist.join("blocked.js").join("keep"), "x").unwrap();

        config.out_dir = dist.clone();
        config.cache.persistent = false;
        config.mode = EmbedMode::Inline;
        let adapter = ModuleGraphAdapter::new(
            config,
            Arc::new(ArtifactCache::new(CacheLimits::default())),
            Arc::new(ScriptedToolchain::new()),
            Arc::new(NoopWatchHost),
        );

        let failed = build_and_write(&adapter, &adapter.entry_names()).await.unwrap();
        assert_eq!(failed, 2);
        assert!(dist.join("add.js").is_file());
        assert!(dist.join("wasmbed-runtime.js").is_file());
        assert!(!dist.join("broken.js").exists());

        let diagnostics = adapter.diagnostics().drain();
        assert!(diagnostics.iter().any(|d| d.entry == "broken" && d.is_error()));
        assert!(diagnostics.iter().any(|d| d.entry == "blocked" && d.is_error()));
        assert!(!diagnostics.iter().any(|d| d.entry == "add"));
    }
}
