//! Snippet Library - immutable revisions behind a mutable head
//!
//! The index never decides whether a missing snippet is fatal; lookups
//! return `None` and the caller turns that into a diagnostic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use crate::hashing::compute_snippet_hash;

pub type SnippetId = String;
pub type Revision = u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Snippet {snippet_id} rev {rev}: hash mismatch (stored {stored}, computed {computed})")]
    HashMismatch {
        snippet_id: String,
        rev: Revision,
        stored: String,
        computed: String,
    },

    #[error("Snippet {snippet_id}: head revision {head_rev} has no version")]
    HeadMissing { snippet_id: String, head_rev: Revision },

    #[error("Snippet {snippet_id} rev {rev}: parent revision {parent_rev} is not an earlier version")]
    BrokenLineage {
        snippet_id: String,
        rev: Revision,
        parent_rev: Revision,
    },

    #[error("Snippet {snippet_id}: revision {rev} appears more than once")]
    DuplicateRevision { snippet_id: String, rev: Revision },
}

/// Mutable head pointer of a snippet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub id: SnippetId,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub head_rev: Revision,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub frontmatter: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One append-only revision of a snippet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnippetVersion {
    pub rev: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_rev: Option<Revision>,
    pub body: String,
    #[serde(default)]
    pub frontmatter: Map<String, Value>,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl SnippetVersion {
    /// Build a version with its integrity hash filled in.
    pub fn new(
        rev: Revision,
        parent_rev: Option<Revision>,
        body: impl Into<String>,
        frontmatter: Map<String, Value>,
    ) -> Self {
        let body = body.into();
        let hash = compute_snippet_hash(&body, &frontmatter);
        Self { rev, parent_rev, body, frontmatter, hash, timestamp: None }
    }

    pub fn computed_hash(&self) -> String {
        compute_snippet_hash(&self.body, &self.frontmatter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnippetBundle {
    pub snippet: Snippet,
    #[serde(default)]
    pub versions: Vec<SnippetVersion>,
}

impl SnippetBundle {
    /// Bundle whose path equals its id and whose head is the last version.
    pub fn from_versions(id: impl Into<String>, versions: Vec<SnippetVersion>) -> Self {
        let id = id.into();
        let head = versions.iter().max_by_key(|v| v.rev);
        let snippet = Snippet {
            path: id.clone(),
            id,
            title: None,
            head_rev: head.map_or(0, |v| v.rev),
            body: head.map(|v| v.body.clone()).unwrap_or_default(),
            frontmatter: head.map(|v| v.frontmatter.clone()).unwrap_or_default(),
            updated_at: None,
        };
        Self { snippet, versions }
    }

    /// Single-revision bundle.
    pub fn single(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::from_versions(id, vec![SnippetVersion::new(1, None, body, Map::new())])
    }

    pub fn version(&self, rev: Revision) -> Option<&SnippetVersion> {
        self.versions.iter().find(|v| v.rev == rev)
    }
}

/// Recompute every stored version hash and check the revision chain.
///
/// Never called implicitly by the compiler.
pub fn verify_snippet_integrity(bundle: &SnippetBundle) -> Result<(), IntegrityError> {
    let snippet_id = &bundle.snippet.id;
    let mut seen = BTreeSet::new();

    for version in &bundle.versions {
        if !seen.insert(version.rev) {
            return Err(IntegrityError::DuplicateRevision {
                snippet_id: snippet_id.clone(),
                rev: version.rev,
            });
        }

        let computed = version.computed_hash();
        if computed != version.hash {
            return Err(IntegrityError::HashMismatch {
                snippet_id: snippet_id.clone(),
                rev: version.rev,
                stored: version.hash.clone(),
                computed,
            });
        }
    }

    for version in &bundle.versions {
        if let Some(parent_rev) = version.parent_rev {
            if parent_rev >= version.rev || !seen.contains(&parent_rev) {
                return Err(IntegrityError::BrokenLineage {
                    snippet_id: snippet_id.clone(),
                    rev: version.rev,
                    parent_rev,
                });
            }
        }
    }

    if !seen.contains(&bundle.snippet.head_rev) {
        return Err(IntegrityError::HeadMissing {
            snippet_id: snippet_id.clone(),
            head_rev: bundle.snippet.head_rev,
        });
    }

    Ok(())
}

/// A snippet reference resolved to one immutable revision.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSnippet<'a> {
    pub snippet: &'a Snippet,
    pub version: &'a SnippetVersion,
    pub body: &'a str,
}

/// Lookup tables over a snippet library, by id and by normalized path.
pub struct SnippetIndex<'a> {
    by_id: HashMap<&'a str, &'a SnippetBundle>,
    by_path: HashMap<String, &'a SnippetBundle>,
}

impl<'a> SnippetIndex<'a> {
    /// Later bundles with a duplicate id or path do not replace earlier ones.
    pub fn build(bundles: &'a [SnippetBundle]) -> Self {
        let mut by_id = HashMap::with_capacity(bundles.len());
        let mut by_path = HashMap::with_capacity(bundles.len());
        for bundle in bundles {
            by_id.entry(bundle.snippet.id.as_str()).or_insert(bundle);
            by_path.entry(normalize_path(&bundle.snippet.path)).or_insert(bundle);
        }
        Self { by_id, by_path }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn resolve_by_id(&self, id: &str, revision: Option<Revision>) -> Option<ResolvedSnippet<'a>> {
        self.by_id.get(id).copied().and_then(|bundle| pick_version(bundle, revision))
    }

    pub fn resolve_by_path(&self, path: &str, revision: Option<Revision>) -> Option<ResolvedSnippet<'a>> {
        self.by_path
            .get(&normalize_path(path))
            .copied()
            .and_then(|bundle| pick_version(bundle, revision))
    }

    /// Id match first, then path match.
    pub fn resolve(&self, identifier: &str, revision: Option<Revision>) -> Option<ResolvedSnippet<'a>> {
        match self.by_id.get(identifier).copied() {
            Some(bundle) => pick_version(bundle, revision),
            None => self.resolve_by_path(identifier, revision),
        }
    }
}

fn pick_version(bundle: &SnippetBundle, revision: Option<Revision>) -> Option<ResolvedSnippet<'_>> {
    let rev = revision.unwrap_or(bundle.snippet.head_rev);
    bundle.version(rev).map(|version| ResolvedSnippet {
        snippet: &bundle.snippet,
        version,
        body: version.body.as_str(),
    })
}

/// Case-sensitive path key: surrounding whitespace and a leading `/` or
/// `./` are not significant.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    trimmed.trim_start_matches('/').to_string()
}
