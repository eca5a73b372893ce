//! ForgeDocs Core - Deterministic Document Compiler
//!
//! # The Five Guarantees
//! 1. Same Input, Same Bytes
//! 2. Cycles Degrade, Never Recurse
//! 3. Missing References Stay Visible
//! 4. Status Gates Export
//! 5. The Worker Has No Network

pub mod hashing;
pub mod document;
pub mod snippets;
pub mod diagnostics;
pub mod transclusion;
pub mod variables;
pub mod formatters;
pub mod preflight;
pub mod pipeline;
pub mod sandbox;
pub mod worker;

pub use hashing::{compute_hash, compute_hash_async, stable_stringify};
pub use document::{Block, BlockContent, Document, Edge, VariableDefinition, VariableValue, Variables};
pub use snippets::{verify_snippet_integrity, IntegrityError, Snippet, SnippetBundle, SnippetIndex, SnippetVersion};
pub use diagnostics::{CompilerDiagnostic, Severity};
pub use transclusion::ProvenanceEntry;
pub use formatters::{default_filters, default_formatters, Filter, Formatter};
pub use preflight::{Preflight, PreflightIssue, PreflightReport, PreflightRule};
pub use pipeline::{compile_document, run_preflight, CompilationPipeline, CompileRequest, CompileResult, PipelineError};
pub use sandbox::{ExecutionScope, SandboxError};
pub use worker::{
    compile_with_worker, register_compiler_worker, worker_channel, BridgeError, BridgeOptions, CompilerBridge,
    CompilerWorker, WorkerOptions,
};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
