//! ForgeDocs CLI - JSON bridge for the export pipeline
//!
//! Commands: compile, preflight, verify
//! Outputs JSON to stdout, logs to stderr (FORGEDOCS_LOG)
//! Exit codes: 0 ok, 2 preflight errors or integrity failure, 1 anything else

use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use forgedocs_core::{
    compile_with_worker, verify_snippet_integrity, BridgeOptions, CompilationPipeline, CompileRequest,
    CompilerWorker, Document, SnippetBundle, Variables,
};

const EXIT_REJECTED: u8 = 2;

#[derive(Parser)]
#[command(name = "forgedocs-cli")]
#[command(about = "ForgeDocs CLI - Deterministic Document Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a document to markdown
    Compile {
        #[command(flatten)]
        input: RequestArgs,

        /// Compile on a sandboxed worker thread
        #[arg(long)]
        worker: bool,

        /// Worker timeout in milliseconds
        #[arg(long, requires = "worker")]
        timeout_ms: Option<u64>,

        /// Verify snippet integrity before compiling
        #[arg(long)]
        verify: bool,
    },

    /// Run preflight checks only
    Preflight {
        #[command(flatten)]
        input: RequestArgs,
    },

    /// Verify snippet bundle integrity
    Verify {
        /// JSON file with an array of snippet bundles
        #[arg(short, long)]
        snippets: PathBuf,
    },
}

#[derive(Args)]
struct RequestArgs {
    /// JSON file with the document
    #[arg(short, long)]
    document: PathBuf,

    /// JSON file with an array of snippet bundles
    #[arg(short, long)]
    snippets: Option<PathBuf>,

    /// JSON file with a key/value variables object
    #[arg(short, long)]
    variables: Option<PathBuf>,

    /// Status keys allowed for export (repeatable)
    #[arg(long = "allowed-status")]
    allowed_statuses: Vec<String>,
}

impl RequestArgs {
    fn load(&self) -> Result<CompileRequest, String> {
        let document: Document = read_json(&self.document)?;
        let snippets: Vec<SnippetBundle> = match &self.snippets {
            Some(path) => read_json(path)?,
            None => vec![],
        };
        let variables: Variables = match &self.variables {
            Some(path) => read_json(path)?,
            None => Variables::new(),
        };
        let allowed_statuses = if self.allowed_statuses.is_empty() {
            None
        } else {
            Some(self.allowed_statuses.clone())
        };
        Ok(CompileRequest { document, snippets, variables, allowed_statuses })
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in {}: {}", path.display(), e))
}

fn emit(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(out) => println!("{}", out),
        Err(e) => eprintln!("Failed to encode output: {}", e),
    }
}

fn failure(error: impl std::fmt::Display) -> ExitCode {
    emit(&json!({ "success": false, "error": error.to_string() }));
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("FORGEDOCS_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { input, worker, timeout_ms, verify } => {
            let request = match input.load() {
                Ok(r) => r,
                Err(e) => return failure(e),
            };

            if verify {
                for bundle in &request.snippets {
                    if let Err(e) = verify_snippet_integrity(bundle) {
                        emit(&json!({
                            "success": false,
                            "snippetId": bundle.snippet.id,
                            "error": e.to_string(),
                        }));
                        return ExitCode::from(EXIT_REJECTED);
                    }
                }
            }

            let result = if worker {
                let options = BridgeOptions { timeout: timeout_ms.map(Duration::from_millis) };
                let bridge = match CompilerWorker::spawn(None) {
                    Ok((bridge, _registration)) => bridge,
                    Err(e) => return failure(e),
                };
                match compile_with_worker(Some(&bridge), &request, &options).await {
                    Ok(result) => result,
                    Err(e) => return failure(e),
                }
            } else {
                CompilationPipeline::new().compile(&request)
            };

            let exportable = result.preflight.is_exportable();
            emit(&json!({ "success": exportable, "result": result }));
            if exportable {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_REJECTED)
            }
        }

        Commands::Preflight { input } => {
            let request = match input.load() {
                Ok(r) => r,
                Err(e) => return failure(e),
            };

            let report = CompilationPipeline::new().preflight(&request);
            let exportable = report.is_exportable();
            emit(&json!({ "exportable": exportable, "preflight": report }));
            if exportable {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_REJECTED)
            }
        }

        Commands::Verify { snippets } => {
            let bundles: Vec<SnippetBundle> = match read_json(&snippets) {
                Ok(b) => b,
                Err(e) => return failure(e),
            };

            let failures: Vec<_> = bundles
                .iter()
                .filter_map(|bundle| {
                    verify_snippet_integrity(bundle)
                        .err()
                        .map(|e| json!({ "snippetId": bundle.snippet.id, "error": e.to_string() }))
                })
                .collect();

            let valid = failures.is_empty();
            emit(&json!({ "valid": valid, "checked": bundles.len(), "failures": failures }));
            if valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_REJECTED)
            }
        }
    }
}
