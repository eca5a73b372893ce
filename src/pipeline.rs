//! Compilation Pipeline - Single Entry Point
//!
//! CRITICAL: compile MUST run preflight internally. No bypass.
//! A compile is a pure function of its request: no clock, no random ids,
//! no hash-map iteration order leaking into output.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

use crate::diagnostics::{
    CompilerDiagnostic, COMPILER_FORMATTER_NOT_FOUND, COMPILER_VARIABLE_MISSING,
};
use crate::document::{Block, BlockContent, CompilerSettings, Document, Variables};
use crate::formatters::{default_filters, default_formatters, Filter, Formatter};
use crate::hashing::compute_hash;
use crate::preflight::{Preflight, PreflightInput, PreflightReport};
use crate::sandbox::ExecutionScope;
use crate::snippets::{verify_snippet_integrity, IntegrityError, SnippetBundle, SnippetIndex};
use crate::transclusion::{
    apply_transclusions, include_snippet, ProvenanceEntry, ProvenanceLog, TransclusionContext,
};
use crate::variables::{effective_variables, substitute_variables};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static PREFLIGHT_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_preflight_call_count() -> u32 {
    PREFLIGHT_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_preflight_call_count() {
    PREFLIGHT_CALL_COUNT.store(0, Ordering::SeqCst);
}

/// Separator between rendered blocks: one blank line.
pub const BLOCK_SEPARATOR: &str = "\n\n";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Snippet integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub document: Document,
    #[serde(default)]
    pub snippets: Vec<SnippetBundle>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_statuses: Option<Vec<String>>,
}

impl CompileRequest {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            snippets: vec![],
            variables: Variables::new(),
            allowed_statuses: None,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn preflight_input(&self) -> PreflightInput<'_> {
        PreflightInput {
            document: &self.document,
            snippets: &self.snippets,
            variables: &self.variables,
            allowed_statuses: self.allowed_statuses.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub markdown: String,
    pub text: String,
    pub diagnostics: Vec<CompilerDiagnostic>,
    pub provenance: Vec<ProvenanceEntry>,
    pub preflight: PreflightReport,
    pub hash: String,
}

impl CompileResult {
    pub fn to_json(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The compilation pipeline - single entry point for document compiles
pub struct CompilationPipeline {
    formatters: Vec<Box<dyn Formatter>>,
    filters: Vec<Box<dyn Filter>>,
    preflight: Preflight,
    scope: ExecutionScope,
}

impl CompilationPipeline {
    pub fn new() -> Self {
        Self {
            formatters: default_formatters(),
            filters: default_filters(),
            preflight: Preflight::new(),
            scope: ExecutionScope::new(),
        }
    }

    /// Globals handed to formatters.
    pub fn with_scope(mut self, scope: ExecutionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn scope(&self) -> &ExecutionScope {
        &self.scope
    }

    /// Replace the whole formatter set.
    pub fn with_formatters(mut self, formatters: Vec<Box<dyn Formatter>>) -> Self {
        self.formatters = formatters;
        self
    }

    /// Add a formatter, replacing any existing one with the same id.
    pub fn with_formatter(mut self, formatter: Box<dyn Formatter>) -> Self {
        self.formatters.retain(|f| f.id() != formatter.id());
        self.formatters.push(formatter);
        self
    }

    /// Replace the whole filter chain. Filters run in the given order.
    pub fn with_filters(mut self, filters: Vec<Box<dyn Filter>>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_preflight(mut self, preflight: Preflight) -> Self {
        self.preflight = preflight;
        self
    }

    pub fn formatter(&self, id: &str) -> Option<&dyn Formatter> {
        self.formatters.iter().find(|f| f.id() == id).map(|f| f.as_ref())
    }

    /// Run preflight alone.
    ///
    /// This is the ONLY preflight entry point.
    pub fn preflight(&self, request: &CompileRequest) -> PreflightReport {
        #[cfg(feature = "test-hooks")]
        PREFLIGHT_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        self.preflight.run(&request.preflight_input())
    }

    /// Compile a document.
    ///
    /// CRITICAL: This ALWAYS calls preflight internally. No bypass possible.
    pub fn compile(&self, request: &CompileRequest) -> CompileResult {
        let document = &request.document;
        let settings = CompilerSettings::from_document(document);
        let index = SnippetIndex::build(&request.snippets);
        let scope = effective_variables(document, &request.variables);

        let mut provenance = ProvenanceLog::new();
        let mut diagnostics = vec![];
        let mut missing_vars = BTreeSet::new();
        let mut segments = vec![];

        for block in document.ordered_blocks() {
            let rendered = {
                let mut ctx = TransclusionContext::new(&index, &mut provenance, &mut diagnostics);
                render_block(block, &mut ctx)
            };

            let substituted = substitute_variables(&rendered, &scope);
            missing_vars.extend(substituted.missing);

            let formatted = self.apply_formatter(block, substituted.result, &mut diagnostics);
            if !formatted.is_empty() {
                segments.push(formatted);
            }
        }

        for key in missing_vars {
            diagnostics.push(
                CompilerDiagnostic::warning(
                    COMPILER_VARIABLE_MISSING,
                    format!("Variable '{}' has no value", key),
                )
                .with_details(json!({ "key": key })),
            );
        }

        let markdown = self.assemble(segments, settings.newline);
        let preflight = self.preflight(request);
        let text = flatten_text(&markdown);
        let hash = compute_hash(&markdown);
        let provenance = provenance.into_entries();

        debug!(
            document_id = %document.id,
            blocks = document.blocks.len(),
            diagnostics = diagnostics.len(),
            provenance = provenance.len(),
            preflight_errors = preflight.summary.errors,
            hash = %hash,
            "document compiled"
        );

        CompileResult { markdown, text, diagnostics, provenance, preflight, hash }
    }

    /// Verify every snippet bundle, then compile.
    pub fn compile_verified(&self, request: &CompileRequest) -> Result<CompileResult, PipelineError> {
        for bundle in &request.snippets {
            verify_snippet_integrity(bundle)?;
        }
        Ok(self.compile(request))
    }

    fn apply_formatter(
        &self,
        block: &Block,
        text: String,
        diagnostics: &mut Vec<CompilerDiagnostic>,
    ) -> String {
        let Some(metadata) = &block.metadata else { return text };
        let Some(formatter_id) = metadata.formatter.as_deref() else { return text };
        if text.is_empty() {
            return text;
        }
        match self.formatter(formatter_id) {
            Some(formatter) => formatter.format_in(&text, metadata, &self.scope),
            None => {
                diagnostics.push(
                    CompilerDiagnostic::warning(
                        COMPILER_FORMATTER_NOT_FOUND,
                        format!("Formatter '{}' is not registered", formatter_id),
                    )
                    .with_details(json!({ "blockId": block.id, "formatter": formatter_id })),
                );
                text
            }
        }
    }

    /// Join, filter, terminate with one newline, then apply the newline convention.
    fn assemble(&self, segments: Vec<String>, newline: &str) -> String {
        let joined = segments.join(BLOCK_SEPARATOR);
        let filtered = self.filters.iter().fold(joined, |text, filter| filter.apply(&text));

        let trimmed = filtered.trim_end();
        if trimmed.is_empty() {
            return String::new();
        }
        let mut markdown = String::with_capacity(trimmed.len() + 1);
        markdown.push_str(trimmed);
        markdown.push('\n');

        if newline == "\n" {
            markdown
        } else {
            markdown.replace('\n', newline)
        }
    }
}

impl Default for CompilationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn render_block(block: &Block, ctx: &mut TransclusionContext<'_, '_>) -> String {
    match &block.content {
        BlockContent::Markdown { body } => apply_transclusions(body, ctx),
        BlockContent::Snippet { snippet_id, revision, mode } => {
            match ctx.index.resolve(snippet_id, *revision) {
                Some(resolved) => include_snippet(resolved, *mode, ctx),
                None => {
                    ctx.snippet_not_found(snippet_id, revision.map(|r| json!(r)));
                    missing_placeholder(snippet_id)
                }
            }
        }
        BlockContent::Divider { style } => style.render().to_string(),
        BlockContent::Group { .. } | BlockContent::Comment { .. } => String::new(),
    }
}

/// Visible stand-in for a snippet block that could not be resolved.
pub fn missing_placeholder(snippet_id: &str) -> String {
    format!("{{{{missing:{}}}}}", snippet_id)
}

/// Single-line-friendly projection of the markdown for search and previews.
pub fn flatten_text(markdown: &str) -> String {
    markdown.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compile with the default formatters and filters.
pub fn compile_document(request: &CompileRequest) -> CompileResult {
    CompilationPipeline::default().compile(request)
}

/// Preflight with the default rule set.
pub fn run_preflight(request: &CompileRequest) -> PreflightReport {
    CompilationPipeline::default().preflight(request)
}
