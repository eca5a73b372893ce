//! Document Model - blocks, edges and variable definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type BlockId = String;

/// Current document schema version.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub title: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub export_recipes: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status_key: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_schema_version() -> u32 { SCHEMA_VERSION }

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>, status_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            schema_version: SCHEMA_VERSION,
            title: title.into(),
            blocks: vec![],
            edges: vec![],
            variables: vec![],
            export_recipes: vec![],
            tags: vec![],
            status_key: status_key.into(),
            settings: Map::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Blocks in render order. Ties on `sequence` keep their authored order.
    pub fn ordered_blocks(&self) -> Vec<&Block> {
        let mut blocks: Vec<&Block> = self.blocks.iter().collect();
        blocks.sort_by_key(|b| b.sequence);
        blocks
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: BlockId,
    pub sequence: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BlockMetadata>,
    #[serde(flatten)]
    pub content: BlockContent,
}

impl Block {
    pub fn new(id: impl Into<String>, sequence: i64, content: BlockContent) -> Self {
        Self { id: id.into(), sequence, metadata: None, content }
    }

    pub fn markdown(id: impl Into<String>, sequence: i64, body: impl Into<String>) -> Self {
        Self::new(id, sequence, BlockContent::Markdown { body: body.into() })
    }

    pub fn snippet(id: impl Into<String>, sequence: i64, snippet_id: impl Into<String>) -> Self {
        Self::new(id, sequence, BlockContent::Snippet {
            snippet_id: snippet_id.into(),
            revision: None,
            mode: SnippetMode::Transclude,
        })
    }

    pub fn with_metadata(mut self, metadata: BlockMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn kind(&self) -> &'static str {
        match self.content {
            BlockContent::Markdown { .. } => "markdown",
            BlockContent::Snippet { .. } => "snippet",
            BlockContent::Group { .. } => "group",
            BlockContent::Comment { .. } => "comment",
            BlockContent::Divider { .. } => "divider",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlockContent {
    Markdown {
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    Snippet {
        snippet_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<u32>,
        #[serde(default)]
        mode: SnippetMode,
    },
    Group {
        #[serde(default)]
        children: Vec<BlockId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collapsed: Option<bool>,
    },
    Comment {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolved: Option<bool>,
    },
    Divider {
        #[serde(default)]
        style: DividerStyle,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SnippetMode {
    #[default]
    Transclude,
    Inline,
}

impl SnippetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnippetMode::Transclude => "transclude",
            SnippetMode::Inline => "inline",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DividerStyle {
    #[default]
    Rule,
    Asterisks,
    PageBreak,
}

impl DividerStyle {
    pub fn render(&self) -> &'static str {
        match self {
            DividerStyle::Rule => "---",
            DividerStyle::Asterisks => "* * *",
            DividerStyle::PageBreak => "<div class=\"page-break\"></div>",
        }
    }
}

/// Formatter selection and options carried on a block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl BlockMetadata {
    pub fn formatter(id: impl Into<String>) -> Self {
        Self { formatter: Some(id.into()), ..Default::default() }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// String-valued formatter option.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: BlockId,
    pub target: BlockId,
    #[serde(default)]
    pub kind: EdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Default,
            condition: None,
            source_port: None,
            target_port: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    #[default]
    Default,
    Conditional,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    pub id: String,
    pub key: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<VariableValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl VariableDefinition {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            id: format!("var-{}", key),
            key,
            var_type: VariableType::Text,
            required: None,
            default_value: None,
            options: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = Some(true);
        self
    }

    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    Text,
    Number,
    Boolean,
    Select,
    Date,
}

/// A caller-supplied variable value. Only JSON scalars are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VariableValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl VariableValue {
    /// Text inserted at a substitution site. `null` renders as nothing.
    pub fn render(&self) -> String {
        match self {
            VariableValue::Null => String::new(),
            VariableValue::Bool(b) => b.to_string(),
            VariableValue::Number(n) => n.to_string(),
            VariableValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(s: &str) -> Self { VariableValue::Text(s.to_string()) }
}

impl From<String> for VariableValue {
    fn from(s: String) -> Self { VariableValue::Text(s) }
}

impl From<bool> for VariableValue {
    fn from(b: bool) -> Self { VariableValue::Bool(b) }
}

impl From<i64> for VariableValue {
    fn from(n: i64) -> Self { VariableValue::Number(n.into()) }
}

/// Variables supplied by the caller, ordered for deterministic iteration.
pub type Variables = BTreeMap<String, VariableValue>;

/// Per-document compiler settings read from `Document::settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerSettings {
    pub newline: &'static str,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self { newline: "\n" }
    }
}

impl CompilerSettings {
    pub fn from_document(document: &Document) -> Self {
        let newline = match document.settings.get("newline").and_then(Value::as_str) {
            Some("\r\n") => "\r\n",
            _ => "\n",
        };
        Self { newline }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_kinds_deserialize() {
        let blocks: Vec<Block> = serde_json::from_value(json!([
            {"id": "a", "sequence": 1, "kind": "markdown", "body": "Hi"},
            {"id": "b", "sequence": 2, "kind": "snippet", "snippetId": "alpha", "revision": 3, "mode": "inline"},
            {"id": "c", "sequence": 3, "kind": "group", "children": ["a", "b"], "collapsed": true},
            {"id": "d", "sequence": 4, "kind": "comment", "body": "todo"},
            {"id": "e", "sequence": 5, "kind": "divider", "style": "page-break",
             "metadata": {"formatter": "code", "language": "rust", "title": "x"}}
        ]))
        .unwrap();

        assert_eq!(blocks[1].content, BlockContent::Snippet {
            snippet_id: "alpha".into(),
            revision: Some(3),
            mode: SnippetMode::Inline,
        });
        assert_eq!(blocks[2].kind(), "group");
        assert_eq!(blocks[4].content, BlockContent::Divider { style: DividerStyle::PageBreak });
        let meta = blocks[4].metadata.as_ref().unwrap();
        assert_eq!(meta.formatter.as_deref(), Some("code"));
        assert_eq!(meta.option_str("title"), Some("x"));
    }

    #[test]
    fn test_ordered_blocks_by_sequence() {
        let mut doc = Document::new("d", "Doc", "draft");
        doc.blocks = vec![
            Block::markdown("late", 10, "b"),
            Block::markdown("early", 1, "a"),
        ];
        let ids: Vec<_> = doc.ordered_blocks().iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_variable_values() {
        let vars: Variables = serde_json::from_value(json!({
            "a": "text", "b": 3, "c": true, "d": null, "e": 1.5
        }))
        .unwrap();
        let rendered: Vec<_> = vars.values().map(VariableValue::render).collect();
        assert_eq!(rendered, vec!["text", "3", "true", "", "1.5"]);
    }

    #[test]
    fn test_settings_newline() {
        let mut doc = Document::new("d", "Doc", "draft");
        assert_eq!(CompilerSettings::from_document(&doc).newline, "\n");
        doc.settings.insert("newline".into(), json!("\r\n"));
        assert_eq!(CompilerSettings::from_document(&doc).newline, "\r\n");
        doc.settings.insert("newline".into(), json!("weird"));
        assert_eq!(CompilerSettings::from_document(&doc).newline, "\n");
    }
}
