//! Formatters and Filters
//!
//! Formatters rewrite a single block's rendered text when its metadata asks
//! for one. Filters run once over the assembled document. Both are pure.

use crate::document::BlockMetadata;
use crate::sandbox::ExecutionScope;

pub trait Formatter: Send + Sync {
    fn id(&self) -> &str;
    fn format(&self, text: &str, metadata: &BlockMetadata) -> String;

    /// Format with the pipeline's execution scope in reach. Inside a
    /// registered worker that scope has its network guards installed.
    fn format_in(&self, text: &str, metadata: &BlockMetadata, _scope: &ExecutionScope) -> String {
        self.format(text, metadata)
    }
}

pub trait Filter: Send + Sync {
    fn id(&self) -> &str;
    fn apply(&self, text: &str) -> String;
}

// --- Formatters ---

/// Fenced code block whose fence is longer than any backtick run in the body.
pub struct CodeFormatter;

impl Formatter for CodeFormatter {
    fn id(&self) -> &str { "code" }

    fn format(&self, text: &str, metadata: &BlockMetadata) -> String {
        let language = metadata.language.as_deref().unwrap_or("");
        fence(text, language)
    }
}

pub struct XmlFormatter;

impl Formatter for XmlFormatter {
    fn id(&self) -> &str { "xml" }

    fn format(&self, text: &str, metadata: &BlockMetadata) -> String {
        let tag = metadata
            .option_str("tag")
            .map(sanitize_tag)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "content".to_string());
        format!("<{tag}>\n{text}\n</{tag}>")
    }
}

pub struct BlockquoteFormatter;

impl Formatter for BlockquoteFormatter {
    fn id(&self) -> &str { "blockquote" }

    fn format(&self, text: &str, _metadata: &BlockMetadata) -> String {
        quote_lines(text)
    }
}

/// GitHub-style alert: `> [!NOTE] Title`.
pub struct CalloutFormatter;

impl Formatter for CalloutFormatter {
    fn id(&self) -> &str { "callout" }

    fn format(&self, text: &str, metadata: &BlockMetadata) -> String {
        let kind = metadata
            .option_str("calloutType")
            .map(|k| sanitize_tag(k).to_uppercase())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "NOTE".to_string());
        let header = match metadata.option_str("title").map(str::trim) {
            Some(title) if !title.is_empty() => format!("> [!{}] {}", kind, title),
            _ => format!("> [!{}]", kind),
        };
        if text.is_empty() {
            header
        } else {
            format!("{}\n{}", header, quote_lines(text))
        }
    }
}

/// Wrap `text` in a backtick fence at least one longer than its longest run.
pub fn fence(text: &str, language: &str) -> String {
    let longest = longest_backtick_run(text);
    let ticks = "`".repeat((longest + 1).max(3));
    format!("{ticks}{language}\n{text}\n{ticks}")
}

fn longest_backtick_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for c in text.chars() {
        if c == '`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

fn quote_lines(text: &str) -> String {
    text.split('\n')
        .map(|line| if line.is_empty() { ">".to_string() } else { format!("> {}", line) })
        .collect::<Vec<_>>()
        .join("\n")
}

fn sanitize_tag(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

// --- Filters ---

/// Trims trailing whitespace per line and caps blank-line runs at two.
pub struct WhitespaceFilter;

pub const MAX_BLANK_LINES: usize = 2;

impl Filter for WhitespaceFilter {
    fn id(&self) -> &str { "whitespace" }

    fn apply(&self, text: &str) -> String {
        let mut lines = Vec::new();
        let mut blank_run = 0;
        for line in text.split('\n') {
            let line = line.trim_end();
            if line.is_empty() {
                blank_run += 1;
                if blank_run > MAX_BLANK_LINES {
                    continue;
                }
            } else {
                blank_run = 0;
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

pub fn default_formatters() -> Vec<Box<dyn Formatter>> {
    vec![
        Box::new(CodeFormatter),
        Box::new(XmlFormatter),
        Box::new(BlockquoteFormatter),
        Box::new(CalloutFormatter),
    ]
}

pub fn default_filters() -> Vec<Box<dyn Filter>> {
    vec![Box::new(WhitespaceFilter)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smart_fence_outgrows_content() {
        let meta = BlockMetadata::formatter("code").with_language("md");
        assert_eq!(CodeFormatter.format("let x = 1;", &meta), "```md\nlet x = 1;\n```");

        let nested = "```rust\nfn main() {}\n```";
        let out = CodeFormatter.format(nested, &BlockMetadata::default());
        assert!(out.starts_with("````\n"));
        assert!(out.ends_with("\n````"));

        assert!(fence("a ````` b", "").starts_with("``````\n"));
    }

    #[test]
    fn test_blockquote() {
        assert_eq!(BlockquoteFormatter.format("a\n\nb", &BlockMetadata::default()), "> a\n>\n> b");
    }

    #[test]
    fn test_callout() {
        let meta = BlockMetadata::formatter("callout")
            .with_option("calloutType", "warning")
            .with_option("title", "Careful");
        assert_eq!(
            CalloutFormatter.format("Hot\nsurface", &meta),
            "> [!WARNING] Careful\n> Hot\n> surface"
        );
        assert_eq!(CalloutFormatter.format("x", &BlockMetadata::default()), "> [!NOTE]\n> x");
    }

    #[test]
    fn test_xml_tag_sanitized() {
        let meta = BlockMetadata::formatter("xml").with_option("tag", "ex<ample>");
        assert_eq!(XmlFormatter.format("body", &meta), "<example>\nbody\n</example>");
        assert_eq!(
            XmlFormatter.format("body", &BlockMetadata::default()),
            "<content>\nbody\n</content>"
        );
    }

    #[test]
    fn test_whitespace_filter() {
        let input = "a  \n\n\n\n\nb\t\n\nc";
        assert_eq!(WhitespaceFilter.apply(input), "a\n\n\nb\n\nc");
    }

    #[test]
    fn test_default_sets() {
        let ids: Vec<_> = default_formatters().iter().map(|f| f.id().to_string()).collect();
        assert_eq!(ids, vec!["code", "xml", "blockquote", "callout"]);
        assert_eq!(default_filters()[0].id(), "whitespace");
    }
}
