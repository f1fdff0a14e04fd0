//! Toolchain invocation with single-flight coalescing.
//!
//! [`ToolchainInvoker`] turns a [`BuildRequest`] into a [`BuildArtifact`] by
//! driving a [`Toolchain`]. Concurrent requests for the same fingerprint share
//! one build; builds for the same package root are serialized because they
//! share a target directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::artifact::{inspect_module, ArtifactMetadata, BuildArtifact};
use crate::diagnostic::DiagnosticRecord;
use crate::digest::Digest;
use crate::error::{BuildError, BuildFailure};
use crate::fingerprint::{BuildParams, PackageIdentity, Profile};
use crate::flight::SingleFlight;
use crate::messages::{parse_cargo_stream, DiagnosticsParseError};

/// Portable target used when the configuration does not name one.
pub const DEFAULT_TARGET: &str = "wasm32-unknown-unknown";

/// Everything needed to run one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build_id: Uuid,
    pub identity: Arc<PackageIdentity>,
    pub params: BuildParams,
    pub fingerprint: Digest,
    /// Directory cargo writes into; owned by this build for its duration.
    pub target_dir: PathBuf,
}

impl BuildRequest {
    pub fn new(
        identity: Arc<PackageIdentity>,
        params: BuildParams,
        fingerprint: Digest,
        target_dir: PathBuf,
    ) -> Self {
        Self {
            build_id: Uuid::new_v4(),
            identity,
            params,
            fingerprint,
            target_dir,
        }
    }

    pub fn package_root(&self) -> &Path {
        &self.identity.root
    }
}

/// Raw output of a successful compiler run.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub wasm: Vec<u8>,
    /// Non-fatal records (warnings, notes) emitted alongside the artifact.
    pub diagnostics: Vec<DiagnosticRecord>,
    pub malformed: Vec<DiagnosticsParseError>,
}

/// The native compiler seam.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Run one build. Dropping the returned future must stop the compiler.
    async fn compile(&self, request: &BuildRequest) -> Result<CompileOutput, BuildError>;

    /// Version string folded into every fingerprint.
    async fn version(&self) -> Result<String, BuildError>;
}

// ---------------------------------------------------------------------------
// Cargo
// ---------------------------------------------------------------------------

/// [`Toolchain`] backed by the `cargo` and `rustc` binaries.
#[derive(Debug, Clone)]
pub struct CargoToolchain {
    cargo: PathBuf,
    rustc: PathBuf,
}

impl Default for CargoToolchain {
    fn default() -> Self {
        Self {
            cargo: PathBuf::from("cargo"),
            rustc: PathBuf::from("rustc"),
        }
    }
}

impl CargoToolchain {
    pub fn new(cargo: impl Into<PathBuf>, rustc: impl Into<PathBuf>) -> Self {
        Self {
            cargo: cargo.into(),
            rustc: rustc.into(),
        }
    }

    /// Arguments passed to `cargo` for `request`.
    pub fn build_args(request: &BuildRequest) -> Vec<String> {
        let params = &request.params;
        let mut args = vec![
            "build".to_string(),
            "--lib".to_string(),
            "--manifest-path".to_string(),
            request.identity.manifest_path().to_string_lossy().into_owned(),
            "--target".to_string(),
            params.target.clone(),
            "--message-format=json".to_string(),
            "--target-dir".to_string(),
            request.target_dir.to_string_lossy().into_owned(),
        ];
        if params.profile == Profile::Release {
            args.push("--release".to_string());
        }
        if !params.features.is_empty() {
            args.push("--features".to_string());
            args.push(params.features.join(","));
        }
        if params.no_default_features {
            args.push("--no-default-features".to_string());
        }
        args.extend(params.cargo_args.iter().cloned());
        args
    }
}

#[async_trait]
impl Toolchain for CargoToolchain {
    async fn compile(&self, request: &BuildRequest) -> Result<CompileOutput, BuildError> {
        let package = request.package_root().to_path_buf();
        let args = Self::build_args(request);
        debug!(build_id = %request.build_id, cargo = %self.cargo.display(), ?args, "Spawning cargo");

        let mut command = Command::new(&self.cargo);
        command
            .args(&args)
            .env("CARGO_TERM_COLOR", "never")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !request.params.rustflags.is_empty() {
            command.env(
                "CARGO_ENCODED_RUSTFLAGS",
                request.params.rustflags.join("\u{1f}"),
            );
        }

        let child = command.spawn().map_err(|e| {
            BuildError::Failed(BuildFailure::bare(
                request.build_id,
                package.clone(),
                format!("failed to spawn {}: {e}", self.cargo.display()),
            ))
        })?;

        let output = child.wait_with_output().await.map_err(|e| {
            BuildError::Failed(BuildFailure::bare(
                request.build_id,
                package.clone(),
                format!("failed waiting for cargo: {e}"),
            ))
        })?;

        let stream = parse_cargo_stream(&output.stdout, request.build_id);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(
            build_id = %request.build_id,
            errors = stream.error_count(),
            finished = ?stream.finished,
            malformed = stream.malformed.len(),
            "Parsed cargo output"
        );

        if !output.status.success() {
            let exit_code = output.status.code();
            let message = match exit_code {
                Some(code) => format!("cargo exited with status {code}"),
                None => "cargo was terminated by a signal".to_string(),
            };
            return Err(BuildError::Failed(BuildFailure {
                build_id: request.build_id,
                package,
                exit_code,
                message,
                diagnostics: stream.diagnostics,
                stderr,
                malformed: stream.malformed,
            }));
        }

        let Some(wasm_path) = stream.wasm_artifact(&request.identity.manifest_path()) else {
            return Err(BuildError::Failed(BuildFailure {
                build_id: request.build_id,
                package,
                exit_code: output.status.code(),
                message: "no wasm artifact produced (is crate-type = [\"cdylib\"] set?)"
                    .to_string(),
                diagnostics: stream.diagnostics,
                stderr,
                malformed: stream.malformed,
            }));
        };

        let wasm = tokio::fs::read(&wasm_path).await.map_err(|e| {
            BuildError::Failed(BuildFailure::bare(
                request.build_id,
                package.clone(),
                format!("failed to read {}: {e}", wasm_path.display()),
            ))
        })?;

        Ok(CompileOutput {
            wasm,
            diagnostics: stream.diagnostics,
            malformed: stream.malformed,
        })
    }

    async fn version(&self) -> Result<String, BuildError> {
        let output = Command::new(&self.rustc)
            .arg("-vV")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BuildError::Probe(format!("{}: {e}", self.rustc.display())))?;

        if !output.status.success() {
            return Err(BuildError::Probe(format!(
                "{} -vV exited with {}",
                self.rustc.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// Invoker
// ---------------------------------------------------------------------------

/// Shared result of a build. Both sides are reference counted so every
/// coalesced waiter receives the same value.
pub type BuildOutcome = Result<Arc<BuildArtifact>, Arc<BuildError>>;

/// Callbacks run inside the detached build task, exactly once per build.
///
/// The invoker has no knowledge of caches or diagnostics channels; the
/// caller plugs them in here so a build whose requesters have all gone away
/// still stores its artifact and reports its diagnostics.
pub trait BuildObserver: Send + Sync {
    fn on_started(&self, _request: &BuildRequest) {}

    fn on_finished(&self, request: &BuildRequest, outcome: &BuildOutcome, elapsed: Duration);
}

/// What a requester gets back from [`ToolchainInvoker::build`].
#[derive(Debug, Clone)]
pub struct BuildJoin {
    pub outcome: BuildOutcome,
    /// False when this request joined a build another caller started.
    pub leader: bool,
}

pub struct ToolchainInvoker {
    toolchain: Arc<dyn Toolchain>,
    flights: SingleFlight<Digest, BuildOutcome>,
    root_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Option<Duration>,
}

impl ToolchainInvoker {
    pub fn new(toolchain: Arc<dyn Toolchain>, timeout: Option<Duration>) -> Self {
        Self {
            toolchain,
            flights: SingleFlight::new(),
            root_locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Number of fingerprints currently building.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Build `request`, or join the build already running for its fingerprint.
    ///
    /// `observer` is only used when this call starts the build.
    pub async fn build(&self, request: BuildRequest, observer: Arc<dyn BuildObserver>) -> BuildJoin {
        let fingerprint = request.fingerprint;
        let package = request.package_root().to_path_buf();
        let toolchain = Arc::clone(&self.toolchain);
        let root_lock = self.root_lock(&package);
        let timeout = self.timeout;

        let joined = self
            .flights
            .run(fingerprint, move || async move {
                let _held = root_lock.lock().await;
                observer.on_started(&request);

                let started = Instant::now();
                let outcome = run_build(toolchain.as_ref(), &request, timeout, started)
                    .await
                    .map(Arc::new)
                    .map_err(Arc::new);
                observer.on_finished(&request, &outcome, started.elapsed());
                outcome
            })
            .await;

        let outcome = joined.value.unwrap_or_else(|aborted| {
            warn!(package = %package.display(), error = %aborted, "Build task aborted");
            Err(Arc::new(BuildError::Aborted {
                package,
                reason: aborted.0,
            }))
        });

        BuildJoin {
            outcome,
            leader: joined.leader,
        }
    }

    fn root_lock(&self, root: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.root_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(root.to_path_buf()).or_default())
    }
}

async fn run_build(
    toolchain: &dyn Toolchain,
    request: &BuildRequest,
    timeout: Option<Duration>,
    started: Instant,
) -> Result<BuildArtifact, BuildError> {
    let compiled = match timeout {
        Some(limit) => tokio::time::timeout(limit, toolchain.compile(request))
            .await
            .map_err(|_| BuildError::Timeout {
                build_id: request.build_id,
                package: request.package_root().to_path_buf(),
                timeout: limit,
            })??,
        None => toolchain.compile(request).await?,
    };

    let surface = match inspect_module(&compiled.wasm) {
        Ok(surface) => surface,
        Err(e) => {
            return Err(BuildError::Failed(BuildFailure {
                build_id: request.build_id,
                package: request.package_root().to_path_buf(),
                exit_code: Some(0),
                message: format!("compiler output is not a valid WebAssembly module: {e}"),
                diagnostics: compiled.diagnostics,
                stderr: String::new(),
                malformed: compiled.malformed,
            }))
        }
    };

    let identity = &request.identity;
    let metadata = ArtifactMetadata {
        fingerprint: request.fingerprint,
        package_name: identity.package_name.clone(),
        package_root: identity.root.clone(),
        watched_roots: identity.watched_roots(),
        size: compiled.wasm.len() as u64,
        surface,
        build_id: request.build_id,
        duration_ms: started.elapsed().as_millis() as u64,
        built_at: Utc::now(),
        diagnostics: compiled.diagnostics,
    };

    Ok(BuildArtifact::new(compiled.wasm, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{sample_identity, sample_params, ScriptedToolchain};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        started: AtomicUsize,
        finished: AtomicUsize,
        failed: AtomicUsize,
    }

    impl BuildObserver for CountingObserver {
        fn on_started(&self, _request: &BuildRequest) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_finished(&self, _request: &BuildRequest, outcome: &BuildOutcome, _elapsed: Duration) {
            self.finished.fetch_add(1, Ordering::SeqCst);
            if outcome.is_err() {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn expect_failure(outcome: &BuildOutcome) -> &BuildFailure {
        match outcome {
            Err(err) => match err.as_ref() {
                BuildError::Failed(failure) => failure,
                other => panic!("expected Failed, got {other:?}"),
            },
            Ok(_) => panic!("expected failure, got an artifact"),
        }
    }

    fn request(name: &str, source: &[u8]) -> BuildRequest {
        let identity = Arc::new(sample_identity(name, source));
        let params = sample_params();
        let fingerprint = crate::fingerprint::fingerprint(&identity, &params);
        BuildRequest::new(identity, params, fingerprint, PathBuf::from("/tmp/wasmbed-target"))
    }

    #[test]
    fn test_build_args_release_with_features() {
        let mut req = request("add", b"a");
        req.params.features = vec!["simd".to_string(), "alloc".to_string()];
        req.params.no_default_features = true;
        req.params.cargo_args = vec!["--locked".to_string()];

        let args = CargoToolchain::build_args(&req);
        assert_eq!(args[0], "build");
        assert!(args.contains(&"--release".to_string()));
        assert!(args.contains(&"--message-format=json".to_string()));
        assert!(args.contains(&"simd,alloc".to_string()));
        assert!(args.contains(&"--no-default-features".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--locked"));
        let target_pos = args.iter().position(|a| a == "--target").unwrap();
        assert_eq!(args[target_pos + 1], DEFAULT_TARGET);
    }

    #[test]
    fn test_build_args_dev_profile() {
        let mut req = request("add", b"a");
        req.params.profile = Profile::Dev;
        assert!(!CargoToolchain::build_args(&req).contains(&"--release".to_string()));
    }

    #[tokio::test]
    async fn test_successful_build_produces_artifact() {
        let toolchain = Arc::new(ScriptedToolchain::new());
        let invoker = ToolchainInvoker::new(toolchain.clone(), None);
        let observer = Arc::new(CountingObserver::default());

        let req = request("add", b"pub fn add() {}");
        let fp = req.fingerprint;
        let joined = invoker.build(req, observer.clone()).await;

        let artifact = joined.outcome.expect("build succeeds");
        assert!(joined.leader);
        assert_eq!(artifact.fingerprint(), fp);
        assert_eq!(artifact.exports(), ["add".to_string()]);
        assert_eq!(artifact.metadata().package_name, "add");
        assert_eq!(toolchain.invocations(), 1);
        assert_eq!(observer.started.load(Ordering::SeqCst), 1);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let toolchain = Arc::new(ScriptedToolchain::new().with_delay(Duration::from_millis(50)));
        let invoker = Arc::new(ToolchainInvoker::new(toolchain.clone(), None));
        let observer = Arc::new(CountingObserver::default());
        let req = request("add", b"pub fn add() {}");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let invoker = Arc::clone(&invoker);
            let observer = observer.clone();
            let req = req.clone();
            tasks.push(tokio::spawn(async move { invoker.build(req, observer).await }));
        }

        let mut artifacts = Vec::new();
        for task in tasks {
            artifacts.push(task.await.unwrap().outcome.expect("build succeeds"));
        }

        assert_eq!(toolchain.invocations(), 1);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);
        for artifact in &artifacts[1..] {
            assert!(Arc::ptr_eq(&artifacts[0], artifact));
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_memoized() {
        let toolchain = Arc::new(ScriptedToolchain::new());
        toolchain.push_failure("src/lib.rs", 3, "cannot find value `y` in this scope");
        let invoker = ToolchainInvoker::new(toolchain.clone(), None);
        let observer = Arc::new(CountingObserver::default());
        let req = request("add", b"broken");

        let first = invoker.build(req.clone(), observer.clone()).await;
        let failure = expect_failure(&first.outcome);
        assert_eq!(failure.exit_code, Some(1));
        assert_eq!(failure.diagnostics.len(), 1);

        let second = invoker.build(req, observer.clone()).await;
        assert!(second.outcome.is_ok());
        assert_eq!(toolchain.invocations(), 2);
        assert_eq!(observer.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_reports_build_timeout() {
        let toolchain = Arc::new(ScriptedToolchain::new().with_delay(Duration::from_secs(5)));
        let invoker = ToolchainInvoker::new(toolchain.clone(), Some(Duration::from_millis(20)));
        let observer = Arc::new(CountingObserver::default());

        let joined = invoker.build(request("slow", b"x"), observer.clone()).await;
        let err = joined.outcome.expect_err("timed out");
        assert!(err.is_timeout());
        assert_eq!(observer.failed.load(Ordering::SeqCst), 1);
        assert_eq!(invoker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_build_failure() {
        let toolchain = Arc::new(ScriptedToolchain::new());
        toolchain.push_success(b"not a module".to_vec());
        let invoker = ToolchainInvoker::new(toolchain, None);

        let joined = invoker
            .build(request("add", b"x"), Arc::new(CountingObserver::default()))
            .await;
        let failure = expect_failure(&joined.outcome);
        assert!(failure.message.contains("not a valid WebAssembly module"));
    }

    #[tokio::test]
    async fn test_cancelled_requester_still_completes_build() {
        let toolchain = Arc::new(ScriptedToolchain::new().with_delay(Duration::from_millis(30)));
        let invoker = ToolchainInvoker::new(toolchain.clone(), None);
        let observer = Arc::new(CountingObserver::default());

        let pending = invoker.build(request("add", b"x"), observer.clone());
        let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);
        assert_eq!(observer.failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_build_failed() {
        let toolchain = CargoToolchain::new("/nonexistent/wasmbed-cargo", "/nonexistent/rustc");
        let err = toolchain.compile(&request("add", b"x")).await.expect_err("spawn fails");
        match err {
            BuildError::Failed(failure) => {
                assert_eq!(failure.exit_code, None);
                assert!(failure.message.contains("failed to spawn"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(matches!(toolchain.version().await, Err(BuildError::Probe(_))));
    }
}
