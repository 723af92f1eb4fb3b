//! Normalized data model: records keyed by [`CacheKey`], their [`Value`]s and the
//! field-level merge that reports [`ChangedKeys`].

use std::borrow::Borrow;
use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::fmt;
use serde_json::Value as JsonValue;

/// Stable identity of a normalized entity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub const QUERY_ROOT: &'static str = "QUERY_ROOT";
    pub const MUTATION_ROOT: &'static str = "MUTATION_ROOT";
    pub const SUBSCRIPTION_ROOT: &'static str = "SUBSCRIPTION_ROOT";

    pub fn new(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn query_root() -> Self {
        CacheKey::new(Self::QUERY_ROOT)
    }

    pub fn mutation_root() -> Self {
        CacheKey::new(Self::MUTATION_ROOT)
    }

    pub fn subscription_root() -> Self {
        CacheKey::new(Self::SUBSCRIPTION_ROOT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of an object embedded under `self` at `segment`: `{self}.{segment}`.
    pub fn child(&self, segment: impl fmt::Display) -> Self {
        CacheKey(format!("{}.{}", self.0, segment))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        CacheKey(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        CacheKey(value)
    }
}

/// Leaf value. Numbers keep their JSON representation so equality stays exact.
#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    String(String),
    Number(serde_json::Number),
    Boolean(bool),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Scalar::String(s) => JsonValue::String(s.clone()),
            Scalar::Number(n) => JsonValue::Number(n.clone()),
            Scalar::Boolean(b) => JsonValue::Bool(*b),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::String(s) => f.write_str(s),
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// A stored field value.
///
/// `Object` holds an embedded map that has no identity of its own (e.g. a JSON custom
/// scalar); selectable child objects are normalized into their own records and stored
/// here as `Reference`s.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Scalar(Scalar),
    List(Vec<Value>),
    Reference(CacheKey),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Scalar(Scalar::String(s.into()))
    }

    pub fn reference(key: impl Into<CacheKey>) -> Self {
        Value::Reference(key.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => s.as_str(),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&CacheKey> {
        match self {
            Value::Reference(key) => Some(key),
            _ => None,
        }
    }

    /// Structural conversion of a response value; JSON objects stay embedded.
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Scalar(Scalar::Boolean(*b)),
            JsonValue::Number(n) => Value::Scalar(Scalar::Number(n.clone())),
            JsonValue::String(s) => Value::Scalar(Scalar::String(s.clone())),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect()),
        }
    }

    /// Plain JSON rendering; references render as `{"reference": key}`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Scalar(s) => s.to_json(),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Reference(key) => {
                let mut map = serde_json::Map::new();
                map.insert(crate::persistence::REFERENCE_KEY.to_string(), JsonValue::String(key.to_string()));
                JsonValue::Object(map)
            }
            Value::Object(map) => JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
        }
    }

    /// Pushes every referenced key, at any depth, into `out`.
    pub fn collect_references<'v>(&'v self, out: &mut Vec<&'v CacheKey>) {
        match self {
            Value::Reference(key) => out.push(key),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Value::Object(map) => map.values().for_each(|v| v.collect_references(out)),
            Value::Null | Value::Scalar(_) => {}
        }
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::string(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Scalar(Scalar::Boolean(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Scalar(Scalar::Number(value.into()))
    }
}

/// One `(record, field)` whose value a merge actually altered.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangedKey {
    pub key: CacheKey,
    pub field: String,
}

impl ChangedKey {
    pub fn new(key: impl Into<CacheKey>, field: impl Into<String>) -> Self {
        Self { key: key.into(), field: field.into() }
    }
}

impl fmt::Display for ChangedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.field)
    }
}

/// Result of a merge; the only invalidation signal the cache emits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangedKeys(BTreeSet<ChangedKey>);

impl ChangedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ChangedKey) -> bool {
        self.0.insert(key)
    }

    pub fn contains(&self, key: &ChangedKey) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangedKey> {
        self.0.iter()
    }

    pub fn extend(&mut self, other: ChangedKeys) {
        self.0.extend(other.0)
    }

    /// Record-level view for callers that do not need field granularity.
    pub fn record_keys(&self) -> BTreeSet<CacheKey> {
        self.0.iter().map(|c| c.key.clone()).collect()
    }

    /// True if any changed field is in `dependencies` (the read-set of some watcher).
    pub fn affects(&self, dependencies: &BTreeSet<ChangedKey>) -> bool {
        if self.0.len() <= dependencies.len() {
            self.0.iter().any(|c| dependencies.contains(c))
        } else {
            dependencies.iter().any(|d| self.0.contains(d))
        }
    }
}

impl FromIterator<ChangedKey> for ChangedKeys {
    fn from_iter<I: IntoIterator<Item = ChangedKey>>(iter: I) -> Self {
        ChangedKeys(iter.into_iter().collect())
    }
}

impl IntoIterator for ChangedKeys {
    type Item = ChangedKey;
    type IntoIter = std::collections::btree_set::IntoIter<ChangedKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The field map stored for one key.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    key: CacheKey,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(key: impl Into<CacheKey>) -> Self {
        Self { key: key.into(), fields: BTreeMap::new() }
    }

    pub fn with_fields(key: impl Into<CacheKey>, fields: BTreeMap<String, Value>) -> Self {
        Self { key: key.into(), fields }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Keyed lookup by field storage key; the contract generated accessors wrap.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    pub fn typename(&self) -> Option<&str> {
        self.fields.get("__typename").and_then(Value::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn references(&self) -> Vec<&CacheKey> {
        let mut out = Vec::new();
        self.fields.values().for_each(|v| v.collect_references(&mut out));
        out
    }

    /// Overwrites every field of `other` that is absent here or structurally different,
    /// returning the names of the fields that changed.
    pub fn merge(&mut self, other: Record) -> Vec<String> {
        let mut changed = Vec::new();
        for (field, value) in other.fields {
            match self.fields.entry(field) {
                btree_map::Entry::Vacant(slot) => {
                    changed.push(slot.key().clone());
                    slot.insert(value);
                }
                btree_map::Entry::Occupied(mut slot) => {
                    if *slot.get() != value {
                        changed.push(slot.key().clone());
                        slot.insert(value);
                    }
                }
            }
        }
        changed
    }
}

/// `CacheKey → Record`; both the authoritative store image and the delta of one response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordSet {
    records: BTreeMap<CacheKey, Record>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.records.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Replaces any record stored under the same key.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.key.clone(), record)
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        self.records.remove(key)
    }

    pub fn clear(&mut self) {
        self.records.clear()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&CacheKey, &Record) -> bool) {
        self.records.retain(|k, r| keep(k, r))
    }

    /// Merges one record, inserting it wholesale if its key is new.
    pub fn merge_record(&mut self, record: Record) -> ChangedKeys {
        match self.records.entry(record.key.clone()) {
            btree_map::Entry::Vacant(slot) => {
                let changed = record.fields.keys().map(|f| ChangedKey::new(record.key.clone(), f.clone())).collect();
                slot.insert(record);
                changed
            }
            btree_map::Entry::Occupied(mut slot) => {
                let key = record.key.clone();
                slot.get_mut().merge(record).into_iter().map(|f| ChangedKey::new(key.clone(), f)).collect()
            }
        }
    }

    /// Field-level merge of `delta` into `self`. Merging the same delta twice reports
    /// nothing the second time. Nothing is ever deleted here.
    pub fn merge(&mut self, delta: RecordSet) -> ChangedKeys {
        let mut changed = ChangedKeys::new();
        for record in delta.records.into_values() {
            changed.extend(self.merge_record(record));
        }
        changed
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut set = RecordSet::new();
        for record in iter {
            set.merge_record(record);
        }
        set
    }
}

impl IntoIterator for RecordSet {
    type Item = Record;
    type IntoIter = btree_map::IntoValues<CacheKey, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_values()
    }
}
