//! Durable record storage behind the store.
//!
//! Records are stored as one JSON object per key. A [`Value::Reference`] is written as
//! `{"reference": "<key>"}`; on the way back any object whose only member is
//! `"reference"` becomes a reference again, everything else decodes structurally.

pub mod lru;
pub mod memory;
pub mod redb;
pub mod sqlite;

use crate::error::{CacheError, RecordCodecError};
use crate::record::{CacheKey, Record, Scalar, Value};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Tag of an encoded reference: `{"reference": "<key>"}`. A stored object value with exactly
/// this one string field is indistinguishable from it and decodes as a reference.
pub const REFERENCE_KEY: &str = "reference";

/// A stored row: its key and the decoded record, or why it could not be decoded.
pub type Row = (CacheKey, Result<Record, RecordCodecError>);

/// Storage contract consumed by the store. Writes take `&mut self`: the store only ever
/// runs one of them at a time.
pub trait PersistenceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_schema_if_needed(&mut self) -> Result<(), CacheError>;

    /// Bulk point lookup; keys with no row are simply absent from the result.
    fn select(&self, keys: &[CacheKey]) -> Result<Vec<Row>, CacheError>;

    fn select_all(&self) -> Result<Vec<Row>, CacheError>;

    /// Insert-or-replace of every record, all or nothing.
    fn upsert(&mut self, records: Vec<Record>) -> Result<(), CacheError>;

    fn delete(&mut self, key: &CacheKey) -> Result<bool, CacheError>;

    fn delete_many(&mut self, keys: &[CacheKey]) -> Result<usize, CacheError>;

    fn delete_matching(&mut self, pattern: &KeyPattern) -> Result<usize, CacheError>;

    fn clear(&mut self, vacuum: bool) -> Result<(), CacheError>;

    fn record_count(&self) -> Result<usize, CacheError>;
}

impl<B: PersistenceBackend + ?Sized> PersistenceBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create_schema_if_needed(&mut self) -> Result<(), CacheError> {
        (**self).create_schema_if_needed()
    }

    fn select(&self, keys: &[CacheKey]) -> Result<Vec<Row>, CacheError> {
        (**self).select(keys)
    }

    fn select_all(&self) -> Result<Vec<Row>, CacheError> {
        (**self).select_all()
    }

    fn upsert(&mut self, records: Vec<Record>) -> Result<(), CacheError> {
        (**self).upsert(records)
    }

    fn delete(&mut self, key: &CacheKey) -> Result<bool, CacheError> {
        (**self).delete(key)
    }

    fn delete_many(&mut self, keys: &[CacheKey]) -> Result<usize, CacheError> {
        (**self).delete_many(keys)
    }

    fn delete_matching(&mut self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        (**self).delete_matching(pattern)
    }

    fn clear(&mut self, vacuum: bool) -> Result<(), CacheError> {
        (**self).clear(vacuum)
    }

    fn record_count(&self) -> Result<usize, CacheError> {
        (**self).record_count()
    }
}

pub fn encode_record(record: &Record) -> Result<String, CacheError> {
    let object: Map<String, JsonValue> = record.fields().iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    Ok(serde_json::to_string(&object)?)
}

pub fn decode_record(key: &CacheKey, bytes: &[u8]) -> Result<Record, RecordCodecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| RecordCodecError::InvalidRecordEncoding { key: key.clone(), reason: e.to_string() })?;
    let json: JsonValue = serde_json::from_str(text)
        .map_err(|e| RecordCodecError::InvalidRecordEncoding { key: key.clone(), reason: e.to_string() })?;
    let JsonValue::Object(object) = json else {
        return Err(RecordCodecError::InvalidRecordShape { key: key.clone() });
    };
    let mut fields = BTreeMap::new();
    for (field, value) in object {
        let decoded = decode_value(&value)
            .ok_or_else(|| RecordCodecError::InvalidRecordValue { key: key.clone(), field: field.clone() })?;
        fields.insert(field, decoded);
    }
    Ok(Record::with_fields(key.clone(), fields))
}

fn decode_value(json: &JsonValue) -> Option<Value> {
    Some(match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Scalar(Scalar::Boolean(*b)),
        JsonValue::Number(n) => Value::Scalar(Scalar::Number(n.clone())),
        JsonValue::String(s) => Value::Scalar(Scalar::String(s.clone())),
        JsonValue::Array(items) => Value::List(items.iter().map(decode_value).collect::<Option<Vec<_>>>()?),
        JsonValue::Object(map) if map.len() == 1 && map.contains_key(REFERENCE_KEY) => match map.get(REFERENCE_KEY) {
            Some(JsonValue::String(target)) => Value::Reference(CacheKey::new(target.as_str())),
            _ => return None,
        },
        JsonValue::Object(map) => {
            let mut fields = BTreeMap::new();
            for (k, v) in map {
                fields.insert(k.clone(), decode_value(v)?);
            }
            Value::Object(fields)
        }
    })
}

/// Wildcard key match: `*` is any run of characters, `?` exactly one, letters compare
/// ASCII case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern(String);

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        KeyPattern(pattern.into())
    }

    pub fn all() -> Self {
        KeyPattern::new("*")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, key: &str) -> bool {
        let pattern: Vec<char> = self.0.chars().collect();
        let text: Vec<char> = key.chars().collect();
        let (mut p, mut t) = (0, 0);
        let mut backtrack: Option<(usize, usize)> = None;
        while t < text.len() {
            match pattern.get(p) {
                Some('*') => {
                    backtrack = Some((p, t));
                    p += 1;
                }
                Some('?') => {
                    p += 1;
                    t += 1;
                }
                Some(c) if c.eq_ignore_ascii_case(&text[t]) => {
                    p += 1;
                    t += 1;
                }
                _ => match backtrack {
                    Some((star, consumed)) => {
                        p = star + 1;
                        t = consumed + 1;
                        backtrack = Some((star, consumed + 1));
                    }
                    None => return false,
                },
            }
        }
        pattern[p..].iter().all(|c| *c == '*')
    }

    /// The equivalent `LIKE` pattern, to be used with `ESCAPE '\'`.
    pub fn to_sql_like(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            match c {
                '*' => out.push('%'),
                '?' => out.push('_'),
                '%' | '_' | '\\' => {
                    out.push('\\');
                    out.push(c);
                }
                c => out.push(c),
            }
        }
        out
    }
}

impl From<&str> for KeyPattern {
    fn from(pattern: &str) -> Self {
        KeyPattern::new(pattern)
    }
}
