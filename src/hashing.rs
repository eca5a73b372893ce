//! Hashing System - SHA-256 over canonical text
//!
//! Provides stable serialization and content hashes for artifact
//! fingerprints and snippet integrity. Any change to the output of
//! `stable_stringify` invalidates every stored hash.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Separator between a snippet body and its serialized frontmatter.
pub const FRONTMATTER_SEPARATOR: &str = "\n---\n";

const ASYNC_CHUNK_SIZE: usize = 64 * 1024;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Hash of UTF-8 text.
pub fn compute_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Same digest as [`compute_hash`], yielding to the runtime between chunks so
/// large freshly-authored content does not starve other tasks.
pub async fn compute_hash_async(text: &str) -> String {
    let mut hasher = Sha256::new();
    for chunk in text.as_bytes().chunks(ASYNC_CHUNK_SIZE) {
        hasher.update(chunk);
        tokio::task::yield_now().await;
    }
    hex::encode(hasher.finalize())
}

/// Canonical JSON text (sorted keys, no whitespace).
///
/// `None` fields are expected to be skipped at the serde layer, so absent
/// values never show up as `null`.
pub fn stable_stringify<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// Canonical JSON for an already-dynamic value. Infallible because every
/// leaf is a plain JSON scalar.
pub fn stable_stringify_value(value: &Value) -> String {
    let mut out = String::new();
    // Scalars of a `Value` always serialize.
    let _ = write_value(value, &mut out);
    out
}

fn write_value(v: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match v {
        Value::Object(map) => write_object(map, out)?,
        Value::Array(arr) => {
            out.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut String) -> Result<(), serde_json::Error> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key)?);
        out.push(':');
        write_value(value, out)?;
    }
    out.push('}');
    Ok(())
}

/// Integrity hash of a snippet version:
/// `sha256(body + "\n---\n" + stable_stringify(frontmatter))`
pub fn compute_snippet_hash(body: &str, frontmatter: &Map<String, Value>) -> String {
    let mut canonical = String::with_capacity(body.len() + 64);
    canonical.push_str(body);
    canonical.push_str(FRONTMATTER_SEPARATOR);
    // Object keys and scalars always serialize.
    let _ = write_object(frontmatter, &mut canonical);
    compute_hash(&canonical)
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stable_stringify_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": 3});
        let canonical = stable_stringify(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_stable_stringify_nested_arrays_keep_order() {
        let obj = json!({"list": [3, {"b": 1, "a": null}, "x"]});
        assert_eq!(
            stable_stringify_value(&obj),
            r#"{"list":[3,{"a":null,"b":1},"x"]}"#
        );
    }

    #[test]
    fn test_stable_stringify_skips_absent_fields() {
        #[derive(Serialize)]
        struct Sample {
            kept: u8,
            #[serde(skip_serializing_if = "Option::is_none")]
            absent: Option<u8>,
        }
        let s = stable_stringify(&Sample { kept: 1, absent: None }).unwrap();
        assert_eq!(s, r#"{"kept":1}"#);
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            compute_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_snippet_hash_uses_separator_and_canonical_frontmatter() {
        let fm = |v: Value| v.as_object().cloned().unwrap();
        let a = compute_snippet_hash("body", &fm(json!({"b": 2, "a": 1})));
        let b = compute_snippet_hash("body", &fm(json!({"a": 1, "b": 2})));
        assert_eq!(a, b);
        assert_eq!(a, compute_hash("body\n---\n{\"a\":1,\"b\":2}"));
        assert_eq!(
            compute_snippet_hash("x", &Map::new()),
            compute_hash("x\n---\n{}")
        );
    }

    #[tokio::test]
    async fn test_async_hash_matches_sync() {
        let big = "déjà vu ".repeat(20_000);
        assert_eq!(compute_hash_async(&big).await, compute_hash(&big));
        assert_eq!(compute_hash_async("").await, compute_hash(""));
    }
}
