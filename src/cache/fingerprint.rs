//! Request Fingerprints
//!
//! Deterministic cache keys derived from an endpoint and its query parameters.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Query parameters of a remote request.
pub type Params = Map<String, Value>;

/// Serializes a value as compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// The human-readable string a fingerprint is computed from.
///
/// Invalidation matches patterns against this string, so it starts with the
/// endpoint path.
pub fn fingerprint_source(endpoint: &str, params: &Params) -> String {
    let mut source = String::with_capacity(endpoint.len() + 2);
    source.push_str(endpoint);
    source.push(':');
    write_canonical(&Value::Object(params.clone()), &mut source);
    source
}

/// Hex encoded SHA-256 of [`fingerprint_source`].
pub fn fingerprint(endpoint: &str, params: &Params) -> String {
    let digest = Sha256::digest(fingerprint_source(endpoint, params).as_bytes());
    hex::encode(digest)
}
