//! # Value — the dynamic document value carried through index and query.
//!
//! The storage engine itself treats values as opaque bytes; everything above
//! it (secondary indexes, the query executor) needs a typed, comparable,
//! canonically-encodable representation of "whatever a document field holds".
//! `Value` is that representation: a small tagged union plus a total order
//! and a canonical byte encoding used as secondary-index posting keys.
//!
//! ## Canonical encoding
//!
//! `encode_key` produces `[tag: u8][payload]` where `tag` is one of the type
//! tags below and `payload` is built so that byte-wise comparison of two
//! encoded values of the *same* tag matches their natural order:
//!
//! - `0` Null — no payload.
//! - `1` String — UTF-8 bytes, as-is.
//! - `2` Int(i64) — sign bit flipped, big-endian.
//! - `3` Float(f64) — sortable bit transform, big-endian.
//! - `4` Bool — a single `0`/`1` byte.
//! - `255` fallback — used for `Bytes`, `List`, `Map`; not meaningfully
//!   ordered across values, but stable and round-trippable enough to use as
//!   a distinct posting-list bucket.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Type tag for the canonical byte encoding (see module docs).
pub mod tag {
    pub const NULL: u8 = 0;
    pub const STRING: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const BOOL: u8 = 4;
    pub const FALLBACK: u8 = 255;
}

/// A dynamically-typed document value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the type tag this value encodes under.
    #[must_use]
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => tag::NULL,
            Value::String(_) => tag::STRING,
            Value::Int(_) => tag::INT,
            Value::Float(_) => tag::FLOAT,
            Value::Bool(_) => tag::BOOL,
            Value::Bytes(_) | Value::List(_) | Value::Map(_) => tag::FALLBACK,
        }
    }

    /// Encodes this value into the canonical byte sequence used for
    /// secondary-index posting keys: `[tag: u8][payload]`.
    #[must_use]
    pub fn encode_key(&self) -> Vec<u8> {
        let mut out = vec![self.type_tag()];
        match self {
            Value::Null => {}
            Value::Bool(b) => out.push(if *b { 1 } else { 0 }),
            Value::Int(i) => {
                // Flip the sign bit so two's-complement i64s sort correctly
                // as unsigned big-endian bytes.
                let bits = (*i as u64) ^ (1u64 << 63);
                out.extend_from_slice(&bits.to_be_bytes());
            }
            Value::Float(f) => out.extend_from_slice(&sortable_float_bits(*f).to_be_bytes()),
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => out.extend_from_slice(b),
            Value::List(items) => {
                for item in items {
                    let enc = item.encode_key();
                    out.extend_from_slice(&(enc.len() as u32).to_be_bytes());
                    out.extend_from_slice(&enc);
                }
            }
            Value::Map(fields) => {
                for (k, v) in fields {
                    out.extend_from_slice(&(k.len() as u32).to_be_bytes());
                    out.extend_from_slice(k.as_bytes());
                    let enc = v.encode_key();
                    out.extend_from_slice(&(enc.len() as u32).to_be_bytes());
                    out.extend_from_slice(&enc);
                }
            }
        }
        out
    }

    /// Renders the value as a string for lexicographic cross-type comparison
    /// (§4.10: "otherwise lexicographic on the string representation").
    #[must_use]
    pub fn as_comparison_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::List(_) | Value::Map(_) => format!("{:?}", self),
        }
    }

    /// Attempts to view this value as `f64` for numeric comparison.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Encodes this value into the bytes stored as a document's engine
    /// value, distinct from [`Value::encode_key`]'s one-way, sort-only
    /// encoding — this one round-trips via [`Value::from_storage_bytes`].
    #[must_use]
    pub fn to_storage_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Value serialization is infallible")
    }

    /// Decodes bytes previously produced by [`Value::to_storage_bytes`].
    pub fn from_storage_bytes(bytes: &[u8]) -> Result<Value, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Recursively collects every string leaf reachable from this value,
    /// used by §4.10's field-less text search ("on all string leaf values
    /// recursively if no field").
    pub fn collect_strings<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Value::String(s) => out.push(s.as_str()),
            Value::List(items) => {
                for item in items {
                    item.collect_strings(out);
                }
            }
            Value::Map(fields) => {
                for v in fields.values() {
                    v.collect_strings(out);
                }
            }
            _ => {}
        }
    }
}

/// Bit-transforms an `f64` so unsigned big-endian comparison of the result
/// matches IEEE-754 numeric order (standard "sortable float" trick).
fn sortable_float_bits(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    }
}

/// Total order per §4.10: numeric vs numeric by natural order, otherwise
/// lexicographic on the string representation; null sorts least.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.as_comparison_string().cmp(&b.as_comparison_string()),
        },
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        compare(self, other) == Ordering::Equal && self.type_tag() == other.type_tag()
    }
}
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

/// Builds the collection-view key `<collection>:<doc_id>` used by the query
/// layer's prefix scans (§3 "Collection view").
#[must_use]
pub fn collection_key(collection: &str, doc_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(collection.len() + doc_id.len() + 1);
    out.extend_from_slice(collection.as_bytes());
    out.push(b':');
    out.extend_from_slice(doc_id.as_bytes());
    out
}

/// Returns the `<collection>:` prefix used to scan every document in a
/// collection.
#[must_use]
pub fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(collection.len() + 1);
    out.extend_from_slice(collection.as_bytes());
    out.push(b':');
    out
}

/// Splits a collection-view key back into `(collection, doc_id)`. Returns
/// `None` if `key` does not contain the `:` separator.
#[must_use]
pub fn split_collection_key(key: &[u8]) -> Option<(&str, &str)> {
    let pos = key.iter().position(|&b| b == b':')?;
    let collection = std::str::from_utf8(&key[..pos]).ok()?;
    let doc_id = std::str::from_utf8(&key[pos + 1..]).ok()?;
    Some((collection, doc_id))
}
