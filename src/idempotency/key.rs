//! Idempotency key derivation
//!
//! Keys and request hashes are derived from a canonical rendering of the
//! payload: object keys sorted, volatile fields (`timestamp`, `nonce`,
//! `request_id`) dropped. Two payloads that differ only in those fields map
//! to the same key.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fields that change per attempt and must not affect the key
const VOLATILE_FIELDS: &[&str] = &["timestamp", "nonce", "request_id"];

/// Hex chars of the payload digest kept in a derived key
const KEY_HASH_LEN: usize = 32;

/// Canonical JSON text: sorted object keys, volatile top-level fields removed
pub fn canonical_payload(payload: &Value) -> String {
    let mut out = String::new();
    match payload {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !VOLATILE_FIELDS.contains(&k.as_str()))
                .collect();
            keys.sort();
            write_object(&mut out, keys.into_iter().map(|k| (k, &map[k])));
        }
        other => write_canonical(&mut out, other),
    }
    out
}

fn write_object<'a>(out: &mut String, entries: impl Iterator<Item = (&'a String, &'a Value)>) {
    out.push('{');
    for (i, (k, v)) in entries.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(k.clone()).to_string());
        out.push(':');
        write_canonical(out, v);
    }
    out.push('}');
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            write_object(out, keys.into_iter().map(|k| (k, &map[k])));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Stable hash of a request payload, stored with the record
pub fn request_hash(payload: &Value) -> String {
    sha256_hex(&canonical_payload(payload))
}

/// Deterministic key for (operation, user, payload, entity)
///
/// Format: `<operation_type>:<user_id>:<digest>`
pub fn derive_key(
    operation_type: &str,
    user_id: &str,
    payload: &Value,
    entity_id: Option<&str>,
) -> String {
    let material = format!(
        "{}|{}|{}|{}",
        operation_type,
        user_id,
        entity_id.unwrap_or(""),
        canonical_payload(payload)
    );
    let digest = sha256_hex(&material);
    format!(
        "{}:{}:{}",
        operation_type,
        user_id,
        &digest[..KEY_HASH_LEN]
    )
}
