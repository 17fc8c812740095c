//! Canonical JSON serialization for deterministic hashing and signing.
//!
//! Signatures are computed over the exact bytes produced here, so every
//! verifier must reproduce them bit-for-bit regardless of how the document was
//! built or which order its keys arrived in.
//!
//! ## Canonicalization Rules
//! 1. Object keys are sorted lexicographically by their UTF-8 bytes
//! 2. No insignificant whitespace (`,` and `:` separators only)
//! 3. Integers are written in plain decimal; floating-point numbers are rejected
//! 4. Strings use standard JSON escaping, except that a newline is written as a
//!    raw `0x0A` byte. PEM public keys embedded in root metadata are hashed and
//!    signed in this form by the agents that consume them.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::ser::{CharEscape, CompactFormatter, Formatter};
use serde_json::Value;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("JSON encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Floating-point number not allowed in canonical JSON: {0}")]
    FloatNotAllowed(String),
}

pub type Result<T> = std::result::Result<T, CanonicalError>;

/// Serialize a value to canonical JSON bytes.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    canonicalize(&value)
}

/// Canonicalize an already-parsed JSON document.
///
/// Used for inbound documents (robot manifests) whose signatures cover fields
/// this crate does not model.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>> {
    verify_canonical(value)?;

    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter);
    Sorted(value).serialize(&mut serializer)?;
    Ok(buf)
}

/// Deserialize a value from JSON bytes.
pub fn from_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Reject values that have no canonical encoding.
fn verify_canonical(value: &Value) -> Result<()> {
    match value {
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => {
            Err(CanonicalError::FloatNotAllowed(n.to_string()))
        }
        Value::Array(items) => items.iter().try_for_each(verify_canonical),
        Value::Object(map) => map.values().try_for_each(verify_canonical),
        _ => Ok(()),
    }
}

/// Serializes a JSON value with object entries in sorted key order,
/// independent of how `serde_json::Map` is configured to store them.
struct Sorted<'a>(&'a Value);

impl Serialize for Sorted<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&Sorted(item))?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    out.serialize_entry(key, &Sorted(value))?;
                }
                out.end()
            }
            other => other.serialize(serializer),
        }
    }
}

/// Compact formatter that leaves newlines unescaped inside strings.
struct CanonicalFormatter;

impl Formatter for CanonicalFormatter {
    fn write_char_escape<W>(&mut self, writer: &mut W, char_escape: CharEscape) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        match char_escape {
            CharEscape::LineFeed => writer.write_all(b"\n"),
            other => CompactFormatter.write_char_escape(writer, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestStruct {
        zeta: u64,
        alpha: String,
        mid: Vec<u8>,
    }

    #[test]
    fn test_canonical_serialization_deterministic() {
        let obj = TestStruct {
            zeta: 12345,
            alpha: "test".to_string(),
            mid: vec![1, 2, 3],
        };

        let bytes1 = to_canonical_json(&obj).unwrap();
        let bytes2 = to_canonical_json(&obj).unwrap();

        assert_eq!(bytes1, bytes2, "Serialization must be deterministic");
        assert_eq!(
            String::from_utf8(bytes1).unwrap(),
            r#"{"alpha":"test","mid":[1,2,3],"zeta":12345}"#
        );
    }

    #[test]
    fn test_canonical_deserialization() {
        let obj = TestStruct {
            zeta: 1,
            alpha: "a".to_string(),
            mid: vec![],
        };

        let bytes = to_canonical_json(&obj).unwrap();
        let decoded: TestStruct = from_json(&bytes).unwrap();

        assert_eq!(obj, decoded);
    }

    #[test]
    fn test_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": "s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "a":{"x":"s","y":[1,2]},"b":1 }"#).unwrap();

        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        assert_eq!(
            String::from_utf8(canonicalize(&a).unwrap()).unwrap(),
            r#"{"a":{"x":"s","y":[1,2]},"b":1}"#
        );
    }

    #[test]
    fn test_newlines_are_raw() {
        let pem = json!({ "public": "-----BEGIN PUBLIC KEY-----\nABC\n-----END PUBLIC KEY-----\n" });
        let bytes = canonicalize(&pem).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains("-----\nABC\n-----"));
        assert!(!text.contains("\\n"));
    }

    #[test]
    fn test_other_escapes_preserved() {
        let value = json!({ "s": "quote\" slash\\ tab\t" });
        let text = String::from_utf8(canonicalize(&value).unwrap()).unwrap();
        assert_eq!(text, r#"{"s":"quote\" slash\\ tab\t"}"#);
    }

    #[test]
    fn test_floats_rejected() {
        let value = json!({ "version": 1.5 });
        assert!(matches!(
            canonicalize(&value),
            Err(CanonicalError::FloatNotAllowed(_))
        ));
    }

    #[test]
    fn test_map_key_ordering() {
        let mut map = BTreeMap::new();
        map.insert("z", 1);
        map.insert("a", 2);
        map.insert("m", 3);

        let bytes = to_canonical_json(&map).unwrap();
        assert_eq!(bytes, br#"{"a":2,"m":3,"z":1}"#.to_vec());
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 \n\"\\\\]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_canonicalize_is_idempotent(value in arb_json()) {
            let once = canonicalize(&value).unwrap();
            let twice = canonicalize(&value).unwrap();
            prop_assert_eq!(&once, &twice);

            // raw newlines keep the output from being re-parsed as JSON, so compare
            // after normalizing them back into escapes
            let text = String::from_utf8(once).unwrap();
            let reparsed: Value = serde_json::from_str(&text.replace('\n', "\\n")).unwrap();
            prop_assert_eq!(canonicalize(&reparsed).unwrap(), text.into_bytes());
        }
    }
}
