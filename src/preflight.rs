//! Preflight - static checks over governance metadata and document graphs
//!
//! Rules produce structured issues. The report never blocks compilation;
//! callers gate export on `summary.errors == 0`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

use crate::diagnostics::Severity;
use crate::document::{BlockContent, Document, Variables, VariableValue, SCHEMA_VERSION};
use crate::snippets::{SnippetBundle, SnippetIndex};
use crate::transclusion::scan_tokens;

pub const PREFLIGHT_STATUS_GATE: &str = "PREFLIGHT_STATUS_GATE";
pub const PREFLIGHT_VARIABLE_REQUIRED: &str = "PREFLIGHT_VARIABLE_REQUIRED";
pub const PREFLIGHT_SNIPPET_DEPENDENCY_MISSING: &str = "PREFLIGHT_SNIPPET_DEPENDENCY_MISSING";
pub const PREFLIGHT_SNIPPET_CYCLE: &str = "PREFLIGHT_SNIPPET_CYCLE";
pub const PREFLIGHT_GRAPH_CYCLE: &str = "PREFLIGHT_GRAPH_CYCLE";
pub const PREFLIGHT_EDGE_DANGLING: &str = "PREFLIGHT_EDGE_DANGLING";
pub const PREFLIGHT_GROUP_CHILD_MISSING: &str = "PREFLIGHT_GROUP_CHILD_MISSING";
pub const PREFLIGHT_VARIABLE_OPTION: &str = "PREFLIGHT_VARIABLE_OPTION";
pub const PREFLIGHT_SCHEMA_VERSION: &str = "PREFLIGHT_SCHEMA_VERSION";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreflightIssue {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PreflightIssue {
    fn error(code: &str, message: impl Into<String>, details: Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Error,
            details: Some(details),
        }
    }

    fn warning(code: &str, message: impl Into<String>, details: Value) -> Self {
        Self { severity: Severity::Warning, ..Self::error(code, message, details) }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreflightSummary {
    pub errors: usize,
    pub warnings: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub issues: Vec<PreflightIssue>,
    pub summary: PreflightSummary,
}

impl PreflightReport {
    pub fn from_issues(issues: Vec<PreflightIssue>) -> Self {
        let errors = issues.iter().filter(|i| i.severity == Severity::Error).count();
        let warnings = issues.iter().filter(|i| i.severity == Severity::Warning).count();
        Self { issues, summary: PreflightSummary { errors, warnings } }
    }

    pub fn is_exportable(&self) -> bool {
        self.summary.errors == 0
    }

    pub fn has_issue(&self, code: &str) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }
}

/// Everything a rule may look at.
pub struct PreflightInput<'a> {
    pub document: &'a Document,
    pub snippets: &'a [SnippetBundle],
    pub variables: &'a Variables,
    pub allowed_statuses: Option<&'a [String]>,
}

/// Preflight rule trait - produces issues
pub trait PreflightRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, input: &PreflightInput<'_>) -> Vec<PreflightIssue>;
}

// --- Concrete Rules ---

pub struct StatusGateRule;

impl PreflightRule for StatusGateRule {
    fn name(&self) -> &'static str { "status_gate" }

    fn check(&self, input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
        let allowed = match input.allowed_statuses {
            Some(allowed) if !allowed.is_empty() => allowed,
            _ => return vec![],
        };
        let status_key = &input.document.status_key;
        if allowed.iter().any(|s| s == status_key) {
            return vec![];
        }
        vec![PreflightIssue::error(
            PREFLIGHT_STATUS_GATE,
            format!("Document status '{}' is not allowed for export", status_key),
            json!({ "allowedStatuses": allowed, "statusKey": status_key }),
        )]
    }
}

pub struct RequiredVariablesRule;

impl PreflightRule for RequiredVariablesRule {
    fn name(&self) -> &'static str { "required_variables" }

    fn check(&self, input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
        input
            .document
            .variables
            .iter()
            .filter(|def| def.is_required() && !input.variables.contains_key(&def.key))
            .map(|def| {
                PreflightIssue::error(
                    PREFLIGHT_VARIABLE_REQUIRED,
                    format!("Required variable '{}' is missing", def.key),
                    json!({ "key": def.key, "variableId": def.id }),
                )
            })
            .collect()
    }
}

/// Supplied values for select-style variables must be one of the options.
pub struct VariableOptionsRule;

impl PreflightRule for VariableOptionsRule {
    fn name(&self) -> &'static str { "variable_options" }

    fn check(&self, input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
        let mut issues = vec![];
        for def in &input.document.variables {
            let (Some(options), Some(value)) = (&def.options, input.variables.get(&def.key)) else {
                continue;
            };
            if options.is_empty() || matches!(value, VariableValue::Null) {
                continue;
            }
            let rendered = value.render();
            if !options.iter().any(|o| o == &rendered) {
                issues.push(PreflightIssue::warning(
                    PREFLIGHT_VARIABLE_OPTION,
                    format!("Variable '{}' value '{}' is not one of its options", def.key, rendered),
                    json!({ "key": def.key, "value": rendered, "options": options }),
                ));
            }
        }
        issues
    }
}

pub struct SchemaVersionRule;

impl PreflightRule for SchemaVersionRule {
    fn name(&self) -> &'static str { "schema_version" }

    fn check(&self, input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
        let found = input.document.schema_version;
        if found == SCHEMA_VERSION {
            return vec![];
        }
        vec![PreflightIssue::warning(
            PREFLIGHT_SCHEMA_VERSION,
            format!("Document schema version {} (expected {})", found, SCHEMA_VERSION),
            json!({ "expected": SCHEMA_VERSION, "found": found }),
        )]
    }
}

/// Walks every snippet reachable from the document and checks the
/// transclusion graph for missing nodes and cycles.
pub struct SnippetDependencyRule;

impl PreflightRule for SnippetDependencyRule {
    fn name(&self) -> &'static str { "snippet_dependencies" }

    fn check(&self, input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
        let index = SnippetIndex::build(input.snippets);
        let mut issues = vec![];
        let mut reported_missing = HashSet::new();
        let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut roots: Vec<String> = vec![];
        let mut expanded: HashSet<(String, Option<u32>)> = HashSet::new();
        let mut work: Vec<(String, Option<u32>)> = vec![];

        let mut missing = |reference: &str, revision: Option<u32>, referenced_by: &str, issues: &mut Vec<PreflightIssue>| {
            let key = format!("{}@{:?}", reference, revision);
            if reported_missing.insert(key) {
                issues.push(PreflightIssue::error(
                    PREFLIGHT_SNIPPET_DEPENDENCY_MISSING,
                    format!("Snippet dependency '{}' cannot be resolved", reference),
                    json!({ "snippetId": reference, "revision": revision, "referencedBy": referenced_by }),
                ));
            }
        };

        for block in input.document.ordered_blocks() {
            match &block.content {
                BlockContent::Snippet { snippet_id, revision, .. } => {
                    match index.resolve(snippet_id, *revision) {
                        Some(resolved) => {
                            roots.push(resolved.snippet.id.clone());
                            work.push((resolved.snippet.id.clone(), *revision));
                        }
                        None => missing(snippet_id, *revision, &block.id, &mut issues),
                    }
                }
                BlockContent::Markdown { body } => {
                    for token in scan_tokens(body) {
                        let resolved = token
                            .pinned_revision()
                            .ok()
                            .and_then(|rev| index.resolve(&token.identifier, rev).map(|r| (r, rev)));
                        match resolved {
                            Some((r, rev)) => {
                                roots.push(r.snippet.id.clone());
                                work.push((r.snippet.id.clone(), rev));
                            }
                            None => missing(
                                &token.identifier,
                                token.pinned_revision().ok().flatten(),
                                &block.id,
                                &mut issues,
                            ),
                        }
                    }
                }
                _ => {}
            }
        }

        // Depth first over snippet bodies; each (id, revision) body is scanned once.
        work.reverse();
        while let Some((id, revision)) = work.pop() {
            if !expanded.insert((id.clone(), revision)) {
                continue;
            }
            let Some(resolved) = index.resolve_by_id(&id, revision) else { continue };
            let edges = graph.entry(id.clone()).or_default();
            let mut next = vec![];
            for token in scan_tokens(resolved.body) {
                let target = token
                    .pinned_revision()
                    .ok()
                    .and_then(|rev| index.resolve(&token.identifier, rev).map(|r| (r.snippet.id.clone(), rev)));
                match target {
                    Some((target_id, rev)) => {
                        if !edges.contains(&target_id) {
                            edges.push(target_id.clone());
                        }
                        next.push((target_id, rev));
                    }
                    None => missing(&token.identifier, token.pinned_revision().ok().flatten(), &id, &mut issues),
                }
            }
            next.reverse();
            work.extend(next);
        }

        let mut seen_cycles = HashSet::new();
        for cycle in find_cycles(&roots, &graph) {
            if seen_cycles.insert(canonical_cycle(&cycle)) {
                issues.push(PreflightIssue::error(
                    PREFLIGHT_SNIPPET_CYCLE,
                    format!("Snippet transclusion cycle: {}", cycle.join(" -> ")),
                    json!({ "cycle": cycle }),
                ));
            }
        }

        issues
    }
}

/// `document.edges` as a directed graph over existing block ids.
pub struct BlockGraphRule;

impl PreflightRule for BlockGraphRule {
    fn name(&self) -> &'static str { "block_graph" }

    fn check(&self, input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
        let document = input.document;
        let block_ids: HashSet<&str> = document.blocks.iter().map(|b| b.id.as_str()).collect();
        let mut issues = vec![];
        let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for edge in &document.edges {
            let dangling: Vec<&str> = [edge.source.as_str(), edge.target.as_str()]
                .into_iter()
                .filter(|id| !block_ids.contains(id))
                .collect();
            if !dangling.is_empty() {
                issues.push(PreflightIssue::warning(
                    PREFLIGHT_EDGE_DANGLING,
                    format!("Edge '{}' references unknown block(s): {}", edge.id, dangling.join(", ")),
                    json!({ "edgeId": edge.id, "source": edge.source, "target": edge.target }),
                ));
                continue;
            }
            let targets = graph.entry(edge.source.clone()).or_default();
            if !targets.contains(&edge.target) {
                targets.push(edge.target.clone());
            }
        }

        let roots: Vec<String> = document.ordered_blocks().iter().map(|b| b.id.clone()).collect();
        let mut seen_cycles = HashSet::new();
        for cycle in find_cycles(&roots, &graph) {
            if seen_cycles.insert(canonical_cycle(&cycle)) {
                issues.push(PreflightIssue::error(
                    PREFLIGHT_GRAPH_CYCLE,
                    format!("Block graph cycle: {}", cycle.join(" -> ")),
                    json!({ "cycle": cycle }),
                ));
            }
        }

        for block in document.ordered_blocks() {
            if let BlockContent::Group { children, .. } = &block.content {
                for child in children.iter().filter(|c| !block_ids.contains(c.as_str())) {
                    issues.push(PreflightIssue::warning(
                        PREFLIGHT_GROUP_CHILD_MISSING,
                        format!("Group '{}' lists unknown child '{}'", block.id, child),
                        json!({ "groupId": block.id, "childId": child }),
                    ));
                }
            }
        }

        issues
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth first search with visiting/done coloring over an explicit
/// `(node, next_child)` stack. Every back edge yields one cycle, written as
/// a closed path (`a -> b -> a`).
fn find_cycles(roots: &[String], graph: &BTreeMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut cycles = vec![];

    let mut start: Vec<&str> = roots.iter().map(String::as_str).collect();
    start.extend(graph.keys().map(String::as_str));

    for root in start {
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root, Mark::Visiting);
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];

        while let Some(&(node, next)) = stack.last() {
            let targets = graph.get(node).map(Vec::as_slice).unwrap_or(&[]);
            let Some(target) = targets.get(next) else {
                marks.insert(node, Mark::Done);
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            match marks.get(target.as_str()) {
                Some(Mark::Visiting) => {
                    if let Some(pos) = stack.iter().position(|(n, _)| *n == target.as_str()) {
                        let mut cycle: Vec<String> = stack[pos..].iter().map(|(n, _)| n.to_string()).collect();
                        cycle.push(target.clone());
                        cycles.push(cycle);
                    }
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(target.as_str(), Mark::Visiting);
                    stack.push((target.as_str(), 0));
                }
            }
        }
    }
    cycles
}

/// Rotation-independent key for a closed cycle path.
fn canonical_cycle(cycle: &[String]) -> Vec<String> {
    let open = &cycle[..cycle.len().saturating_sub(1)];
    let Some(min_pos) = open.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)).map(|(i, _)| i) else {
        return vec![];
    };
    open[min_pos..].iter().chain(open[..min_pos].iter()).cloned().collect()
}

/// Preflight orchestrates rules in a fixed order.
pub struct Preflight {
    rules: Vec<Box<dyn PreflightRule>>,
}

impl Preflight {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(StatusGateRule),
                Box::new(RequiredVariablesRule),
                Box::new(VariableOptionsRule),
                Box::new(SchemaVersionRule),
                Box::new(SnippetDependencyRule),
                Box::new(BlockGraphRule),
            ],
        }
    }

    /// Extra checks run after the built-in ones.
    pub fn with_rule(mut self, rule: Box<dyn PreflightRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn run(&self, input: &PreflightInput<'_>) -> PreflightReport {
        let mut issues = vec![];
        for rule in &self.rules {
            let found = rule.check(input);
            trace!(rule = rule.name(), issues = found.len(), "preflight rule evaluated");
            issues.extend(found);
        }
        PreflightReport::from_issues(issues)
    }
}

impl Default for Preflight {
    fn default() -> Self {
        Self::new()
    }
}
