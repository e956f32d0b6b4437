//! Deterministic hashing and size accounting
//!
//! The source string is a typed, key-sorted flattening of a JSON value so that
//! hashes do not depend on field order. Sizes count string lengths, 8 bytes
//! per number and 1 per boolean, ignoring keys.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{AaError, Result};
use crate::ledger::unit::Unit;

const STRING_JOIN_CHAR: &str = "\u{0}";

/// Fixed header allowance for parent unit references
pub const PARENT_UNITS_SIZE: u64 = 2 * 44;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Hashing and size utilities consumed by the composer
pub trait UnitHasher: Send + Sync {
    fn payload_hash(&self, payload: &Value) -> Result<String>;
    fn unit_hash(&self, unit: &Unit) -> Result<String>;
    fn headers_size(&self, unit: &Unit) -> Result<u64>;
    fn total_payload_size(&self, unit: &Unit) -> Result<u64>;
    /// Address derived from an address definition
    fn definition_address(&self, definition: &Value) -> Result<String>;
}

/// SHA-256 over the deterministic source string
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectHasher;

impl UnitHasher for ObjectHasher {
    fn payload_hash(&self, payload: &Value) -> Result<String> {
        Ok(base64_sha256(&source_string(payload)?))
    }

    fn unit_hash(&self, unit: &Unit) -> Result<String> {
        let mut naked = serde_json::to_value(unit)?;
        if let Some(obj) = naked.as_object_mut() {
            obj.remove("unit");
            obj.remove("headers_commission");
            obj.remove("payload_commission");
            if let Some(Value::Array(messages)) = obj.get_mut("messages") {
                for message in messages.iter_mut() {
                    if let Some(m) = message.as_object_mut() {
                        m.remove("payload");
                    }
                }
            }
        }
        Ok(base64_sha256(&source_string(&naked)?))
    }

    fn headers_size(&self, unit: &Unit) -> Result<u64> {
        let mut header = serde_json::to_value(unit)?;
        if let Some(obj) = header.as_object_mut() {
            for field in [
                "unit",
                "headers_commission",
                "payload_commission",
                "messages",
                "parent_units",
            ] {
                obj.remove(field);
            }
        }
        Ok(value_length(&header) + PARENT_UNITS_SIZE)
    }

    fn total_payload_size(&self, unit: &Unit) -> Result<u64> {
        let messages = serde_json::to_value(&unit.messages)?;
        Ok(value_length(&messages))
    }

    fn definition_address(&self, definition: &Value) -> Result<String> {
        let digest = Sha256::digest(source_string(definition)?.as_bytes());
        Ok(base32(&digest[..20]))
    }
}

/// Typed, key-sorted flattening of a JSON value
///
/// Nulls, empty arrays and empty objects have no representation and are
/// rejected.
pub fn source_string(value: &Value) -> Result<String> {
    let mut components = Vec::new();
    extract_components(value, value, &mut components)?;
    Ok(components.join(STRING_JOIN_CHAR))
}

fn extract_components(value: &Value, root: &Value, out: &mut Vec<String>) -> Result<()> {
    match value {
        Value::Null => Err(AaError::Serialization(format!("null value in {}", root))),
        Value::String(s) => {
            out.push("s".to_string());
            out.push(s.clone());
            Ok(())
        }
        Value::Number(n) => {
            out.push("n".to_string());
            out.push(n.to_string());
            Ok(())
        }
        Value::Bool(b) => {
            out.push("b".to_string());
            out.push(b.to_string());
            Ok(())
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Err(AaError::Serialization(format!("empty array in {}", root)));
            }
            out.push("[".to_string());
            for item in items {
                extract_components(item, root, out)?;
            }
            out.push("]".to_string());
            Ok(())
        }
        Value::Object(map) => {
            if map.is_empty() {
                return Err(AaError::Serialization(format!("empty object in {}", root)));
            }
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                out.push(key.clone());
                extract_components(&map[key.as_str()], root, out)?;
            }
            Ok(())
        }
    }
}

/// Serialized size of a value, keys excluded
pub fn value_length(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        // UTF-16 code units, the unit of string length in the wire format
        Value::String(s) => s.encode_utf16().count() as u64,
        Value::Number(_) => 8,
        Value::Bool(_) => 1,
        Value::Array(items) => items.iter().map(value_length).sum(),
        Value::Object(map) => map.values().map(value_length).sum(),
    }
}

fn base64_sha256(source: &str) -> String {
    STANDARD.encode(Sha256::digest(source.as_bytes()))
}

fn base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::unit::{Author, Message};
    use serde_json::json;

    #[test]
    fn source_string_sorts_keys_and_prefixes_types() {
        let value = json!({"b": 1, "a": ["x", true]});
        let expected = ["a", "[", "s", "x", "b", "true", "]", "b", "n", "1"].join("\u{0}");
        assert_eq!(source_string(&value).expect("source"), expected);
    }

    #[test]
    fn source_string_is_order_independent() {
        let a = json!({"x": 1, "y": {"p": "q", "r": 2}});
        let b = json!({"y": {"r": 2, "p": "q"}, "x": 1});
        assert_eq!(
            source_string(&a).expect("a"),
            source_string(&b).expect("b")
        );
    }

    #[test]
    fn source_string_rejects_empty_and_null() {
        assert!(source_string(&json!({"a": []})).is_err());
        assert!(source_string(&json!({"a": {}})).is_err());
        assert!(source_string(&json!({"a": null})).is_err());
    }

    #[test]
    fn lengths_ignore_keys() {
        assert_eq!(value_length(&json!({"address": "ABCD", "amount": 5})), 4 + 8);
        assert_eq!(value_length(&json!([true, "xy", null])), 1 + 2);
    }

    #[test]
    fn payload_hash_has_fixed_length() {
        let hash = ObjectHasher
            .payload_hash(&json!({"outputs": [{"address": "A", "amount": 1}]}))
            .expect("hash");
        assert_eq!(hash.len(), crate::ledger::unit::HASH_LENGTH);
    }

    #[test]
    fn unit_hash_ignores_commissions() {
        let mut unit = Unit {
            version: "4.0".into(),
            alt: "1".into(),
            authors: vec![Author::new("AA")],
            messages: vec![Message {
                app: "data".into(),
                payload_location: Some("inline".into()),
                payload_hash: Some("h".repeat(44)),
                payload: json!({"k": "v"}),
            }],
            parent_units: vec!["P".into()],
            ..Default::default()
        };
        let before = ObjectHasher.unit_hash(&unit).expect("hash");
        unit.headers_commission = Some(100);
        unit.payload_commission = Some(200);
        assert_eq!(ObjectHasher.unit_hash(&unit).expect("hash"), before);
    }

    #[test]
    fn definition_address_is_32_base32_chars() {
        let address = ObjectHasher
            .definition_address(&json!(["sig", {"pubkey": "Ao1"}]))
            .expect("address");
        assert_eq!(address.len(), 32);
        assert!(address.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
    }
}
