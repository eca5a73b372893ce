//! Transclusion Engine - recursive `{{> id[@rev]}}` expansion
//!
//! The chain of snippets currently being expanded is carried explicitly in
//! `TransclusionContext::stack`; a snippet already on the stack is a cycle.
//! Unresolved and cyclic tokens stay in the text verbatim.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::OnceLock;

use crate::diagnostics::{CompilerDiagnostic, COMPILER_SNIPPET_CYCLE, COMPILER_SNIPPET_NOT_FOUND};
use crate::document::SnippetMode;
use crate::snippets::{ResolvedSnippet, Revision, SnippetId, SnippetIndex};

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{>\s*([^\s{}@]+)(?:@([^\s{}]*))?\s*\}\}").expect("transclusion pattern is valid")
    })
}

/// A transclusion token found in a piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransclusionToken {
    pub span: Range<usize>,
    pub identifier: String,
    /// `None` when no `@rev` was written.
    pub revision: Option<RevisionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionSpec {
    Pinned(Revision),
    /// Text after `@` that is not a revision number.
    Invalid(String),
}

impl TransclusionToken {
    /// Revision to resolve, or `Err` if the token can never resolve.
    pub fn pinned_revision(&self) -> Result<Option<Revision>, &str> {
        match &self.revision {
            None => Ok(None),
            Some(RevisionSpec::Pinned(rev)) => Ok(Some(*rev)),
            Some(RevisionSpec::Invalid(raw)) => Err(raw.as_str()),
        }
    }
}

/// All transclusion tokens in `text`, left to right.
pub fn scan_tokens(text: &str) -> Vec<TransclusionToken> {
    token_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let identifier = caps.get(1)?.as_str().to_string();
            let revision = caps.get(2).map(|m| match m.as_str().parse::<Revision>() {
                Ok(rev) => RevisionSpec::Pinned(rev),
                Err(_) => RevisionSpec::Invalid(m.as_str().to_string()),
            });
            Some(TransclusionToken { span: whole.range(), identifier, revision })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceEntry {
    pub snippet_id: SnippetId,
    pub revision: Revision,
    pub hash: String,
    pub mode: SnippetMode,
    pub path: String,
}

/// Provenance deduplicated on `snippetId@revision:mode`, first occurrence wins.
#[derive(Debug, Default)]
pub struct ProvenanceLog {
    entries: Vec<ProvenanceEntry>,
    seen: HashSet<String>,
}

impl ProvenanceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resolved: &ResolvedSnippet<'_>, mode: SnippetMode) {
        let key = format!("{}@{}:{}", resolved.snippet.id, resolved.version.rev, mode.as_str());
        if self.seen.insert(key) {
            self.entries.push(ProvenanceEntry {
                snippet_id: resolved.snippet.id.clone(),
                revision: resolved.version.rev,
                hash: resolved.version.hash.clone(),
                mode,
                path: resolved.snippet.path.clone(),
            });
        }
    }

    pub fn entries(&self) -> &[ProvenanceEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ProvenanceEntry> {
        self.entries
    }
}

pub struct TransclusionContext<'c, 'a> {
    pub index: &'c SnippetIndex<'a>,
    pub provenance: &'c mut ProvenanceLog,
    pub diagnostics: &'c mut Vec<CompilerDiagnostic>,
    stack: Vec<SnippetId>,
    on_stack: HashSet<SnippetId>,
}

impl<'c, 'a> TransclusionContext<'c, 'a> {
    pub fn new(
        index: &'c SnippetIndex<'a>,
        provenance: &'c mut ProvenanceLog,
        diagnostics: &'c mut Vec<CompilerDiagnostic>,
    ) -> Self {
        Self { index, provenance, diagnostics, stack: vec![], on_stack: HashSet::new() }
    }

    /// Snippets currently being expanded, outermost first.
    pub fn stack(&self) -> &[SnippetId] {
        &self.stack
    }

    pub fn is_expanding(&self, snippet_id: &str) -> bool {
        self.on_stack.contains(snippet_id)
    }

    fn enter(&mut self, snippet_id: &str) {
        self.stack.push(snippet_id.to_string());
        self.on_stack.insert(snippet_id.to_string());
    }

    fn leave(&mut self) {
        if let Some(id) = self.stack.pop() {
            self.on_stack.remove(&id);
        }
    }

    /// Record a `COMPILER_SNIPPET_NOT_FOUND` diagnostic.
    pub fn snippet_not_found(&mut self, reference: &str, revision: Option<Value>) {
        self.diagnostics.push(
            CompilerDiagnostic::error(
                COMPILER_SNIPPET_NOT_FOUND,
                format!("Snippet not found: {}", reference),
            )
            .with_details(json!({
                "reference": reference,
                "revision": revision,
                "stack": self.stack,
            })),
        );
    }

    fn token_not_found(&mut self, token: &TransclusionToken) {
        let revision = token.revision.as_ref().map(|r| match r {
            RevisionSpec::Pinned(rev) => json!(rev),
            RevisionSpec::Invalid(raw) => json!(raw),
        });
        self.snippet_not_found(&token.identifier, revision);
    }

    fn cycle(&mut self, snippet_id: &str) {
        let mut chain = self.stack.clone();
        chain.push(snippet_id.to_string());
        self.diagnostics.push(
            CompilerDiagnostic::error(
                COMPILER_SNIPPET_CYCLE,
                format!("Snippet cycle detected: {}", chain.join(" -> ")),
            )
            .with_details(json!({ "snippetId": snippet_id, "stack": chain })),
        );
    }
}

/// One body being expanded: its remaining tokens and the output so far.
struct Frame<'t> {
    text: &'t str,
    tokens: std::vec::IntoIter<TransclusionToken>,
    cursor: usize,
    out: String,
}

impl<'t> Frame<'t> {
    fn new(text: &'t str) -> Self {
        Self {
            text,
            tokens: scan_tokens(text).into_iter(),
            cursor: 0,
            out: String::with_capacity(text.len()),
        }
    }

    fn finish(mut self) -> String {
        self.out.push_str(&self.text[self.cursor..]);
        self.out
    }
}

/// Expand every transclusion token in `text`, depth first, left to right.
///
/// Nesting is tracked on an explicit frame stack, so chain length is bounded
/// by memory rather than by the thread's call stack.
pub fn apply_transclusions(text: &str, ctx: &mut TransclusionContext<'_, '_>) -> String {
    let mut frames = vec![Frame::new(text)];

    while let Some(frame) = frames.last_mut() {
        let Some(token) = frame.tokens.next() else {
            let Some(done) = frames.pop() else { break };
            let expanded = done.finish();
            match frames.last_mut() {
                Some(parent) => {
                    ctx.leave();
                    parent.out.push_str(&expanded);
                }
                None => return expanded,
            }
            continue;
        };

        let body = frame.text;
        frame.out.push_str(&body[frame.cursor..token.span.start]);
        frame.cursor = token.span.end;
        let raw = &body[token.span.clone()];

        let resolved = match token.pinned_revision() {
            Ok(revision) => ctx.index.resolve(&token.identifier, revision),
            Err(_) => None,
        };
        let Some(resolved) = resolved else {
            ctx.token_not_found(&token);
            frame.out.push_str(raw);
            continue;
        };

        if ctx.is_expanding(&resolved.snippet.id) {
            ctx.cycle(&resolved.snippet.id);
            frame.out.push_str(raw);
            continue;
        }

        ctx.provenance.record(&resolved, SnippetMode::Transclude);
        ctx.enter(&resolved.snippet.id);
        frames.push(Frame::new(resolved.body));
    }

    String::new()
}

/// Record provenance for `resolved` and return its fully expanded body.
///
/// The caller is responsible for the cycle check.
pub fn include_snippet(
    resolved: ResolvedSnippet<'_>,
    mode: SnippetMode,
    ctx: &mut TransclusionContext<'_, '_>,
) -> String {
    ctx.provenance.record(&resolved, mode);
    ctx.enter(&resolved.snippet.id);
    let expanded = apply_transclusions(resolved.body, ctx);
    ctx.leave();
    expanded
}
