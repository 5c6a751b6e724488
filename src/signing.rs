//! Bitunix's double-sha256 request signing (§6).
//!
//! `sign = sha256(sha256(nonce ‖ timestamp ‖ apiKey ‖ sortedQueryString ‖ canonicalBody) ‖ apiSecret)`

use sha2::{Digest, Sha256};

fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Concatenate query params sorted by key as `k1v1k2v2…`, with no separators.
pub fn query_string_for_sign(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    sorted.iter().map(|(k, v)| format!("{}{}", k, v)).collect()
}

/// Canonical JSON body for signing: sorted keys, no whitespace.
///
/// `serde_json::Value` preserves the sorted-key property only when backed by
/// a `BTreeMap`-ordered map; `serde_json`'s default `Map` is insertion-order,
/// so we re-serialize through a `BTreeMap` to guarantee key order here.
pub fn canonical_body(value: &serde_json::Value) -> String {
    fn to_sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), to_sorted(v)))
                    .collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(to_sorted).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&to_sorted(value)).unwrap_or_default()
}

/// Generate a random hex nonce, as the wire protocol requires (§6).
pub fn random_nonce() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// Compute the request signature from its already-canonicalized parts.
pub fn sign_request(nonce: &str, timestamp_ms: &str, api_key: &str, query_str: &str, body_str: &str, api_secret: &str) -> String {
    let digest1 = sha256_hex(&format!("{}{}{}{}{}", nonce, timestamp_ms, api_key, query_str, body_str));
    sha256_hex(&format!("{}{}", digest1, api_secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_sorts_by_key() {
        let params = vec![("b", "2".to_string()), ("a", "1".to_string())];
        assert_eq!(query_string_for_sign(&params), "a1b2");
    }

    #[test]
    fn canonical_body_sorts_object_keys() {
        let value = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(canonical_body(&value), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn canonical_body_has_no_whitespace() {
        let value = serde_json::json!({"symbol": "BTCUSDT", "qty": "0.5"});
        let s = canonical_body(&value);
        assert!(!s.contains(' '));
    }

    #[test]
    fn sign_request_is_deterministic() {
        let s1 = sign_request("nonce1", "1000", "key", "qs", "body", "secret");
        let s2 = sign_request("nonce1", "1000", "key", "qs", "body", "secret");
        assert_eq!(s1, s2);
        assert_eq!(s1.len(), 64);
    }

    #[test]
    fn sign_request_changes_with_any_input() {
        let base = sign_request("nonce1", "1000", "key", "qs", "body", "secret");
        let changed = sign_request("nonce2", "1000", "key", "qs", "body", "secret");
        assert_ne!(base, changed);
    }
}
