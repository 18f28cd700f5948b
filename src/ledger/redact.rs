//! Secret redaction applied to every payload before it is hashed and
//! persisted. Runs before hashing so the chain commits to the redacted
//! form, never to the secret.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

/// Field names whose values are always dropped, compared case-insensitively.
const SECRET_KEYS: &[&str] = &["apikey", "api_key", "token", "password", "authorization"];

/// Long unbroken base64-ish runs in string values (API keys, bearer blobs).
static LONG_CREDENTIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9+/]{40,}").expect("static regex compiles"));

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEYS.contains(&lower.as_str())
}

/// Recursively replace obvious secrets in `value`.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                if is_secret_key(key) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) => Value::String(redact_str(s)),
        other => other.clone(),
    }
}

fn redact_str(s: &str) -> String {
    if LONG_CREDENTIAL.is_match(s) {
        LONG_CREDENTIAL.replace_all(s, REDACTED).into_owned()
    } else {
        s.to_string()
    }
}
