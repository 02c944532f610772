//! Canonical JSON serialization for policy documents and scope fingerprints.
//!
//! Policy payloads sent to identity providers double as inputs to cache key
//! fingerprints, so two semantically identical documents must serialize to the
//! same bytes. Canonical JSON here has:
//!
//! - Object keys sorted lexicographically (UTF-8 byte order), recursively
//! - No whitespace
//! - Array order preserved (callers sort sets before serializing)
//! - Integers only; floats are rejected
//!
//! Equivalent Python for cross-checking fixtures:
//!
//! ```python
//! json.dumps(value, sort_keys=True, separators=(",", ":"), ensure_ascii=False)
//! ```

use std::io::Write;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during canonical JSON serialization.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    /// Serde JSON conversion failed.
    #[error("serde_json error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Float values are not allowed in canonical JSON.
    #[error("float values are not allowed in canonical JSON (use integers)")]
    FloatNotAllowed,

    /// IO error while writing into the output buffer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Output was not valid UTF-8.
    #[error("UTF-8 encoding error")]
    Utf8Error,
}

/// Serializes `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if serialization fails, or
/// `CanonicalJsonError::FloatNotAllowed` if the value contains a float.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let v = serde_json::to_value(value)?;
    let mut out = Vec::<u8>::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// Same as [`to_canonical_bytes`], but returns a `String`.
///
/// # Errors
///
/// See [`to_canonical_bytes`].
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    String::from_utf8(bytes).map_err(|_| CanonicalJsonError::Utf8Error)
}

/// Returns the lowercase hex SHA-256 of the canonical JSON encoding of `value`.
///
/// # Errors
///
/// See [`to_canonical_bytes`].
pub fn sha256_fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn write_value(v: &Value, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    match v {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => serde_json::to_writer(&mut *out, s)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map, out)?,
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

    out.push(b'{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        serde_json::to_writer(&mut *out, key)?;
        out.push(b':');
        write_value(value, out)?;
    }
    out.push(b'}');
    Ok(())
}

fn write_number(n: &Number, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    if let Some(i) = n.as_i64() {
        write!(out, "{i}")?;
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        write!(out, "{u}")?;
        return Ok(());
    }
    Err(CanonicalJsonError::FloatNotAllowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively_without_whitespace() {
        let v = json!({
            "Statement": [{"Effect": "Allow", "Action": ["s3:GetObject"]}],
            "Version": "2012-10-17"
        });
        let s = to_canonical_string(&v).unwrap_or_else(|e| panic!("canonicalize failed: {e}"));
        assert_eq!(
            s,
            r#"{"Statement":[{"Action":["s3:GetObject"],"Effect":"Allow"}],"Version":"2012-10-17"}"#
        );
    }

    #[test]
    fn preserves_array_order() {
        let s = to_canonical_string(&json!(["b", "a"]))
            .unwrap_or_else(|e| panic!("canonicalize failed: {e}"));
        assert_eq!(s, r#"["b","a"]"#);
    }

    #[test]
    fn rejects_floats() {
        for case in [r#"{"x": 1.25}"#, r#"{"x": 1.0}"#, r"[1e3]"] {
            let v: Value = serde_json::from_str(case)
                .unwrap_or_else(|e| panic!("failed to parse test JSON {case}: {e}"));
            assert!(
                matches!(to_canonical_string(&v), Err(CanonicalJsonError::FloatNotAllowed)),
                "case {case} should be rejected"
            );
        }
    }

    #[test]
    fn integers_and_escapes_are_stable() {
        let v = json!({"n": -42, "big": u64::MAX, "s": "a\"b\nc"});
        let s = to_canonical_string(&v).unwrap_or_else(|e| panic!("canonicalize failed: {e}"));
        assert_eq!(s, r#"{"big":18446744073709551615,"n":-42,"s":"a\"b\nc"}"#);
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = sha256_fingerprint(&json!({"role": "r", "paths": ["p"]}))
            .unwrap_or_else(|e| panic!("fingerprint failed: {e}"));
        let b = sha256_fingerprint(&json!({"paths": ["p"], "role": "r"}))
            .unwrap_or_else(|e| panic!("fingerprint failed: {e}"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::{BTreeMap, HashMap};

        proptest! {
            #[test]
            fn insertion_order_does_not_affect_canonical_output(
                pairs in prop::collection::vec(("[a-z:]{1,12}", "[a-z0-9/*]{1,16}"), 1..12)
            ) {
                let hashmap: HashMap<String, String> = pairs.iter().cloned().collect();
                let btreemap: BTreeMap<String, String> = pairs.iter().cloned().collect();

                let from_hash = to_canonical_string(&hashmap)
                    .unwrap_or_else(|e| panic!("failed to canonicalize hashmap: {e}"));
                let from_btree = to_canonical_string(&btreemap)
                    .unwrap_or_else(|e| panic!("failed to canonicalize btreemap: {e}"));

                prop_assert_eq!(from_hash, from_btree);
            }
        }
    }
}
