//! In-process test doubles.
//!
//! [`ScriptedToolchain`] stands in for cargo: it counts invocations, can be
//! slowed down, and replays a queue of scripted outcomes before falling back
//! to a small valid module exporting `add`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use wasm_encoder::{
    CodeSection, CustomSection, ExportKind, ExportSection, Function, FunctionSection, Instruction,
    Module, TypeSection, ValType,
};

use crate::diagnostic::{DiagnosticRecord, Severity};
use crate::digest::Digest;
use crate::error::{BuildError, BuildFailure};
use crate::fingerprint::{BuildParams, PackageIdentity, Profile, SourceEntry};
use crate::invoker::{BuildRequest, CompileOutput, Toolchain, DEFAULT_TARGET};
use crate::messages::DiagnosticsParseError;

/// Build a valid module exporting one `(i32, i32) -> i32` function per name,
/// with `custom` stored in a custom section so distinct inputs give distinct
/// bytes.
pub fn wasm_module(exports: &[&str], custom: &[u8]) -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32, ValType::I32], [ValType::I32]);
    module.section(&types);

    let mut funcs = FunctionSection::new();
    for _ in exports {
        funcs.function(0);
    }
    module.section(&funcs);

    let mut export_section = ExportSection::new();
    for (idx, name) in exports.iter().enumerate() {
        export_section.export(name, ExportKind::Func, idx as u32);
    }
    module.section(&export_section);

    let mut code = CodeSection::new();
    for _ in exports {
        let mut f = Function::new([]);
        f.instruction(&Instruction::LocalGet(0));
        f.instruction(&Instruction::LocalGet(1));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::End);
        code.function(&f);
    }
    module.section(&code);

    if !custom.is_empty() {
        module.section(&CustomSection {
            name: "wasmbed-fake".into(),
            data: custom.into(),
        });
    }

    module.finish()
}

/// Identity for a package that does not exist on disk.
pub fn sample_identity(name: &str, source: &[u8]) -> PackageIdentity {
    PackageIdentity {
        root: PathBuf::from(format!("/fake/{name}")),
        package_name: name.to_string(),
        files: vec![SourceEntry {
            path: "src/lib.rs".to_string(),
            hash: Digest::compute(source),
        }],
        manifest: Digest::compute(name.as_bytes()),
        lock: None,
        dependencies: Vec::new(),
    }
}

pub fn sample_params() -> BuildParams {
    BuildParams {
        target: DEFAULT_TARGET.to_string(),
        profile: Profile::Release,
        features: Vec::new(),
        no_default_features: false,
        cargo_args: Vec::new(),
        rustflags: Vec::new(),
        embed_mode: "inline".to_string(),
        compiler_version: ScriptedToolchain::VERSION.to_string(),
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Success(Vec<u8>),
    Failure {
        file: String,
        line: u32,
        message: String,
    },
    /// Non-zero exit with only unparseable output on stdout.
    Garbled { stderr: String },
}

#[derive(Default)]
pub struct ScriptedToolchain {
    invocations: AtomicUsize,
    delay: Duration,
    script: Mutex<VecDeque<Scripted>>,
    built: Mutex<Vec<Digest>>,
}

impl ScriptedToolchain {
    pub const VERSION: &'static str = "rustc 1.80.0 (scripted)";

    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every compile.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Next compile exits 1 with a single error at `file:line`.
    pub fn push_failure(&self, file: &str, line: u32, message: &str) {
        self.script.lock().unwrap().push_back(Scripted::Failure {
            file: file.to_string(),
            line,
            message: message.to_string(),
        });
    }

    /// Next compile returns `bytes` verbatim.
    pub fn push_success(&self, bytes: Vec<u8>) {
        self.script.lock().unwrap().push_back(Scripted::Success(bytes));
    }

    /// Next compile exits 101 with no structured diagnostics.
    pub fn push_garbled(&self, stderr: &str) {
        self.script.lock().unwrap().push_back(Scripted::Garbled {
            stderr: stderr.to_string(),
        });
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Fingerprints of every compile started, in order.
    pub fn built(&self) -> Vec<Digest> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl Toolchain for ScriptedToolchain {
    async fn compile(&self, request: &BuildRequest) -> Result<CompileOutput, BuildError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.built.lock().unwrap().push(request.fingerprint);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Success(wasm)) => Ok(CompileOutput {
                wasm,
                ..CompileOutput::default()
            }),
            Some(Scripted::Failure {
                file,
                line,
                message,
            }) => {
                let record = DiagnosticRecord::new(Severity::Error, &message, request.build_id)
                    .with_span(file.clone(), line, 1)
                    .with_rendered(format!("error: {message}\n --> {file}:{line}:1"));
                Err(BuildError::Failed(BuildFailure {
                    build_id: request.build_id,
                    package: request.package_root().to_path_buf(),
                    exit_code: Some(1),
                    message: "cargo exited with status 1".to_string(),
                    diagnostics: vec![record],
                    stderr: "error: could not compile due to 1 previous error".to_string(),
                    malformed: Vec::new(),
                }))
            }
            Some(Scripted::Garbled { stderr }) => Err(BuildError::Failed(BuildFailure {
                build_id: request.build_id,
                package: request.package_root().to_path_buf(),
                exit_code: Some(101),
                message: "cargo exited with status 101".to_string(),
                diagnostics: Vec::new(),
                stderr,
                malformed: vec![DiagnosticsParseError {
                    line: 1,
                    reason: "expected value at line 1 column 1".to_string(),
                }],
            })),
            None => Ok(CompileOutput {
                wasm: wasm_module(&["add"], request.fingerprint.as_bytes()),
                ..CompileOutput::default()
            }),
        }
    }

    async fn version(&self) -> Result<String, BuildError> {
        Ok(Self::VERSION.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::inspect_module;

    #[test]
    fn wasm_module_is_valid_and_distinct() {
        let a = wasm_module(&["add"], b"one");
        let b = wasm_module(&["add"], b"two");
        assert_ne!(a, b);
        assert_eq!(inspect_module(&a).unwrap().exports, vec!["add".to_string()]);
    }

    #[test]
    fn sample_identity_changes_with_source() {
        assert_ne!(
            sample_identity("add", b"a").digest(),
            sample_identity("add", b"b").digest()
        );
    }
}
