//! Variable Substitution - `{{identifier}}` placeholders

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::document::{Document, Variables};

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // `>` is not in the identifier class, so transclusion tokens never match.
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{([a-zA-Z0-9_.-]+)\}\}").expect("placeholder pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub result: String,
    /// Unknown identifiers, deduplicated and sorted.
    pub missing: Vec<String>,
}

/// Replace placeholders with supplied values. Unknown placeholders are left
/// as written and reported in `missing`.
pub fn substitute_variables(text: &str, variables: &Variables) -> Substitution {
    let mut missing = BTreeSet::new();
    let result = placeholder_pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match variables.get(key) {
                Some(value) => value.render(),
                None => {
                    missing.insert(key.to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned();

    Substitution { result, missing: missing.into_iter().collect() }
}

/// Rendering scope: definition defaults overlaid by caller values.
pub fn effective_variables(document: &Document, supplied: &Variables) -> Variables {
    let mut scope: Variables = document
        .variables
        .iter()
        .filter_map(|def| def.default_value.clone().map(|v| (def.key.clone(), v)))
        .collect();
    scope.extend(supplied.iter().map(|(k, v)| (k.clone(), v.clone())));
    scope
}
