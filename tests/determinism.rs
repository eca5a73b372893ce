//! Property tests: identical inputs always compile to identical bytes.

use forgedocs_core::{
    compile_document, compute_hash, stable_stringify,
    diagnostics::COMPILER_SNIPPET_NOT_FOUND,
    document::{Block, BlockMetadata, Document, Edge},
    preflight::PREFLIGHT_SNIPPET_DEPENDENCY_MISSING,
    CompileRequest, SnippetBundle, VariableValue, Variables,
};
use proptest::prelude::*;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// A snippet reference by id, by path, or by a path with a leading `./`.
/// Index 4 never exists.
fn arb_reference() -> impl Strategy<Value = String> {
    (0usize..5, 0usize..3).prop_map(|(i, form)| match form {
        0 => format!("snip{}", i),
        1 => format!("lib/snip{}.md", i),
        _ => format!("./lib/snip{}.md", i),
    })
}

/// A fragment of block or snippet text: prose, a variable, or a transclusion.
fn arb_fragment() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z ,.]{1,16}",
        (0usize..3).prop_map(|i| format!("{{{{var{}}}}}", i)),
        arb_reference().prop_map(|r| format!("{{{{> {}}}}}", r)),
        Just("\n".to_string()),
        Just("\n\n\n\n".to_string()),
    ]
}

fn arb_text() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_fragment(), 0..8).prop_map(|parts| parts.concat())
}

fn arb_block(index: usize) -> impl Strategy<Value = Block> {
    let id = format!("b{}", index);
    (0i64..6, prop::bool::ANY, arb_text(), arb_reference(), prop::option::of(Just("blockquote")))
        .prop_map(move |(sequence, is_snippet, body, reference, formatter)| {
            let block = if is_snippet {
                Block::snippet(id.clone(), sequence, reference)
            } else {
                Block::markdown(id.clone(), sequence, body)
            };
            match formatter {
                Some(f) => block.with_metadata(BlockMetadata::formatter(f)),
                None => block,
            }
        })
}

fn arb_document() -> impl Strategy<Value = Document> {
    (1usize..6)
        .prop_flat_map(|count| {
            let blocks: Vec<_> = (0..count).map(arb_block).collect();
            let edges = prop::collection::vec((0..count, 0..count), 0..4);
            (blocks, edges)
        })
        .prop_map(|(blocks, edges)| {
            let mut document = Document::new("doc-prop", "Property", "draft");
            document.edges = edges
                .into_iter()
                .enumerate()
                .map(|(i, (s, t))| Edge::new(format!("e{}", i), format!("b{}", s), format!("b{}", t)))
                .collect();
            document.blocks = blocks;
            document
        })
}

/// Up to four snippets whose bodies may reference each other, cycles included.
fn arb_snippets() -> impl Strategy<Value = Vec<SnippetBundle>> {
    prop::collection::vec(arb_text(), 0..4).prop_map(|bodies| {
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| {
                let mut bundle = SnippetBundle::single(format!("snip{}", i), body);
                bundle.snippet.path = format!("lib/snip{}.md", i);
                bundle
            })
            .collect()
    })
}

fn arb_variables() -> impl Strategy<Value = Variables> {
    prop::collection::btree_map(
        (0usize..3).prop_map(|i| format!("var{}", i)),
        prop_oneof![
            "[a-z]{0,8}".prop_map(VariableValue::from),
            any::<bool>().prop_map(VariableValue::from),
            any::<i64>().prop_map(VariableValue::from),
            Just(VariableValue::Null),
        ],
        0..3,
    )
}

fn arb_request() -> impl Strategy<Value = CompileRequest> {
    (arb_document(), arb_snippets(), arb_variables(), prop::option::of(Just(vec!["ready".to_string()])))
        .prop_map(|(document, snippets, variables, allowed_statuses)| CompileRequest {
            document,
            snippets,
            variables,
            allowed_statuses,
        })
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_repeat_compile_is_identical(request in arb_request()) {
        let first = compile_document(&request);
        let second = compile_document(&request);

        prop_assert_eq!(&first.hash, &second.hash);
        prop_assert_eq!(&first.markdown, &second.markdown);
        prop_assert_eq!(&first.text, &second.text);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_hash_and_terminator(request in arb_request()) {
        let result = compile_document(&request);

        prop_assert_eq!(result.hash, compute_hash(&result.markdown));
        prop_assert!(result.markdown.is_empty() || result.markdown.ends_with('\n'));
        prop_assert!(!result.markdown.ends_with("\n\n"));
        prop_assert!(!result.markdown.contains("\n\n\n\n"));
    }

    #[test]
    fn prop_json_round_trip_compiles_the_same(request in arb_request()) {
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded = CompileRequest::from_json(&encoded).unwrap();

        prop_assert_eq!(compile_document(&decoded), compile_document(&request));
    }

    #[test]
    fn prop_render_and_preflight_agree_on_missing_snippets(request in arb_request()) {
        let result = compile_document(&request);

        let render_missing = result.diagnostics.iter().any(|d| d.code == COMPILER_SNIPPET_NOT_FOUND);
        let preflight_missing = result.preflight.has_issue(PREFLIGHT_SNIPPET_DEPENDENCY_MISSING);
        prop_assert_eq!(render_missing, preflight_missing);
    }

    #[test]
    fn prop_stable_stringify_ignores_insertion_order(
        entries in prop::collection::vec(("[a-z]{1,6}", any::<i64>()), 0..12)
    ) {
        let mut forward = Map::new();
        for (k, v) in &entries {
            forward.entry(k.clone()).or_insert(Value::from(*v));
        }
        let mut backward = Map::new();
        for (k, _) in entries.iter().rev() {
            backward.insert(k.clone(), forward[k].clone());
        }

        let a = stable_stringify(&Value::Object(forward)).unwrap();
        let b = stable_stringify(&Value::Object(backward)).unwrap();
        prop_assert_eq!(a, b);
    }
}
