//! Canonical JSON and the SHA-256 helpers built on it.
//!
//! Both the approval bind-hash and the ledger chain hash go through the same
//! canonicalization: object keys sorted lexicographically, array order
//! preserved, primitives JSON-encoded with no whitespace. Any divergence
//! between the two call sites would silently break replay detection and
//! token single-use, so the encoding lives here and nowhere else.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` as canonical JSON: sorted keys, compact, UTF-8.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string encoding handles all escaping.
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Compact encoding of primitives is already canonical.
        other => out.push_str(&serde_json::to_string(other).expect("primitive serializes")),
    }
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the canonical JSON of `value`.
pub fn hash_canonical(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Chain hash: SHA-256 over `prev_hash` concatenated with the canonical JSON
/// of `payload`.
pub fn chain_hash(prev_hash: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Byte length of the canonical encoding. Used for argument size caps.
pub fn canonical_len(value: &Value) -> usize {
    canonical_json(value).len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "m": null}});
        assert_eq!(canonical_json(&v), r#"{"a":{"m":null,"z":true},"b":1}"#);
    }

    #[test]
    fn array_order_is_preserved() {
        let v = json!({"list": [3, 1, 2]});
        assert_eq!(canonical_json(&v), r#"{"list":[3,1,2]}"#);
    }

    #[test]
    fn no_whitespace_anywhere() {
        let v = json!({"a": [1, {"b": "c d"}], "e": "f"});
        let s = canonical_json(&v);
        // Only the string value may contain a space.
        assert_eq!(s.matches(' ').count(), 1);
    }

    #[test]
    fn string_escaping_matches_serde() {
        let v = json!({"k\"ey": "va\nlue"});
        assert_eq!(canonical_json(&v), r#"{"k\"ey":"va\nlue"}"#);
    }

    #[test]
    fn equal_values_hash_equal_regardless_of_insertion_order() {
        let a = json!({"x": 1, "y": [true, false]});
        let mut b = serde_json::Map::new();
        b.insert("y".to_string(), json!([true, false]));
        b.insert("x".to_string(), json!(1));
        assert_eq!(hash_canonical(&a), hash_canonical(&Value::Object(b)));
    }

    #[test]
    fn chain_hash_depends_on_prev() {
        let payload = json!({"type": "proposal"});
        assert_ne!(
            chain_hash("GENESIS", &payload),
            chain_hash("deadbeef", &payload)
        );
    }

    #[test]
    fn sha256_hex_is_lowercase_64_chars() {
        let h = sha256_hex(b"warden");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
