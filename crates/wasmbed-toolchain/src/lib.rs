//! wasmbed-toolchain: fingerprinting and WebAssembly builds for wasmbed
//!
//! Everything that touches the native package: computing a content
//! fingerprint for a Cargo package, invoking the compiler for a WebAssembly
//! target, parsing its JSON message stream, and coalescing concurrent builds
//! of the same fingerprint into one.
//!
//! ## Key Components
//!
//! - `fingerprint`: package scan and build fingerprint
//! - `ToolchainInvoker`: single-flight builds over a `Toolchain`
//! - `CargoToolchain`: the real `cargo build --target wasm32-*` implementation
//! - `BuildArtifact`: compiled payload plus metadata, shared as `Arc`

pub mod artifact;
pub mod diagnostic;
pub mod digest;
mod error;
pub mod fakes;
pub mod fingerprint;
pub mod flight;
pub mod invoker;
pub mod messages;

pub use artifact::{inspect_module, ArtifactMetadata, BuildArtifact, ImportRef, ModuleSurface};
pub use diagnostic::{DiagnosticRecord, Severity, Span};
pub use digest::{Digest, FramedHasher, InvalidDigest};
pub use error::{BuildError, BuildFailure, FingerprintError};
pub use fingerprint::{
    fingerprint, fingerprint_package, scan_package, BuildParams, PackageIdentity, Profile,
};
pub use invoker::{
    BuildJoin, BuildObserver, BuildOutcome, BuildRequest, CargoToolchain, CompileOutput,
    Toolchain, ToolchainInvoker, DEFAULT_TARGET,
};
pub use messages::{parse_cargo_stream, DiagnosticsParseError};
