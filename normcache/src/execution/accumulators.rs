use super::{Accumulator, FieldInfo, ObjectInfo};
use crate::error::CacheError;
use crate::record::{CacheKey, ChangedKey, Record, RecordSet, Value};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::marker::PhantomData;

/// Flattens the traversed tree into a [`RecordSet`] delta. Child objects become
/// references to their keys; fields are stored under their storage keys.
///
/// Absent fields produce no entry, so merging the delta leaves the cached value alone. A
/// list with an absent element is left out as a whole.
#[derive(Default)]
pub struct Normalizer {
    records: RefCell<RecordSet>,
}

impl Accumulator for Normalizer {
    type Partial = Option<Value>;
    type FieldEntry = (String, Value);
    type Object = CacheKey;
    type Output = RecordSet;

    fn accept_scalar(&self, value: &Value, _info: &FieldInfo<'_>) -> Result<Option<Value>, CacheError> {
        Ok(Some(value.clone()))
    }

    fn accept_null(&self, _info: &FieldInfo<'_>) -> Result<Option<Value>, CacheError> {
        Ok(Some(Value::Null))
    }

    fn accept_absent(&self, _info: &FieldInfo<'_>) -> Result<Option<Value>, CacheError> {
        Ok(None)
    }

    fn accept_list(&self, items: Vec<Option<Value>>, _info: &FieldInfo<'_>) -> Result<Option<Value>, CacheError> {
        Ok(items.into_iter().collect::<Option<Vec<_>>>().map(Value::List))
    }

    fn accept_child_object(&self, key: CacheKey, _info: &FieldInfo<'_>) -> Result<Option<Value>, CacheError> {
        Ok(Some(Value::Reference(key)))
    }

    fn accept_field_entry(&self, value: Option<Value>, info: &FieldInfo<'_>) -> Result<Option<(String, Value)>, CacheError> {
        Ok(value.map(|value| (info.storage_key.clone(), value)))
    }

    fn accept_field_entries(&self, entries: Vec<(String, Value)>, info: &ObjectInfo) -> Result<CacheKey, CacheError> {
        let record = Record::with_fields(info.key.clone(), entries.into_iter().collect());
        // the same entity may appear at several places of one response
        self.records.borrow_mut().merge_record(record);
        Ok(info.key.clone())
    }

    fn finish(&self, _root: CacheKey, _info: &ObjectInfo) -> Result<RecordSet, CacheError> {
        Ok(self.records.take())
    }
}

/// Plain JSON keyed by response keys.
#[derive(Default, Clone, Copy)]
pub struct JsonCollector;

impl Accumulator for JsonCollector {
    type Partial = JsonValue;
    type FieldEntry = (String, JsonValue);
    type Object = Map<String, JsonValue>;
    type Output = JsonValue;

    fn accept_scalar(&self, value: &Value, _info: &FieldInfo<'_>) -> Result<JsonValue, CacheError> {
        Ok(value.to_json())
    }

    fn accept_null(&self, _info: &FieldInfo<'_>) -> Result<JsonValue, CacheError> {
        Ok(JsonValue::Null)
    }

    fn accept_list(&self, items: Vec<JsonValue>, _info: &FieldInfo<'_>) -> Result<JsonValue, CacheError> {
        Ok(JsonValue::Array(items))
    }

    fn accept_child_object(&self, object: Map<String, JsonValue>, _info: &FieldInfo<'_>) -> Result<JsonValue, CacheError> {
        Ok(JsonValue::Object(object))
    }

    fn accept_field_entry(&self, value: JsonValue, info: &FieldInfo<'_>) -> Result<Option<(String, JsonValue)>, CacheError> {
        Ok(Some((info.response_key.to_string(), value)))
    }

    fn accept_field_entries(&self, entries: Vec<(String, JsonValue)>, _info: &ObjectInfo) -> Result<Map<String, JsonValue>, CacheError> {
        Ok(entries.into_iter().collect())
    }

    fn finish(&self, root: Map<String, JsonValue>, _info: &ObjectInfo) -> Result<JsonValue, CacheError> {
        Ok(JsonValue::Object(root))
    }
}

/// Deserializes the result into a typed model.
pub struct TypedCollector<T> {
    json: JsonCollector,
    _model: PhantomData<fn() -> T>,
}

impl<T> Default for TypedCollector<T> {
    fn default() -> Self {
        Self { json: JsonCollector, _model: PhantomData }
    }
}

impl<T: DeserializeOwned> Accumulator for TypedCollector<T> {
    type Partial = JsonValue;
    type FieldEntry = (String, JsonValue);
    type Object = Map<String, JsonValue>;
    type Output = T;

    fn accept_scalar(&self, value: &Value, info: &FieldInfo<'_>) -> Result<JsonValue, CacheError> {
        self.json.accept_scalar(value, info)
    }

    fn accept_null(&self, info: &FieldInfo<'_>) -> Result<JsonValue, CacheError> {
        self.json.accept_null(info)
    }

    fn accept_list(&self, items: Vec<JsonValue>, info: &FieldInfo<'_>) -> Result<JsonValue, CacheError> {
        self.json.accept_list(items, info)
    }

    fn accept_child_object(&self, object: Map<String, JsonValue>, info: &FieldInfo<'_>) -> Result<JsonValue, CacheError> {
        self.json.accept_child_object(object, info)
    }

    fn accept_field_entry(&self, value: JsonValue, info: &FieldInfo<'_>) -> Result<Option<(String, JsonValue)>, CacheError> {
        self.json.accept_field_entry(value, info)
    }

    fn accept_field_entries(&self, entries: Vec<(String, JsonValue)>, info: &ObjectInfo) -> Result<Map<String, JsonValue>, CacheError> {
        self.json.accept_field_entries(entries, info)
    }

    fn finish(&self, root: Map<String, JsonValue>, _info: &ObjectInfo) -> Result<T, CacheError> {
        Ok(serde_json::from_value(JsonValue::Object(root))?)
    }
}

/// Collects every `(record, storage key)` the traversal touched, including fields that
/// were absent or failed, so a watcher can tell whether a later change affects it.
#[derive(Default)]
pub struct DependencyTracker {
    keys: RefCell<BTreeSet<ChangedKey>>,
}

impl Accumulator for DependencyTracker {
    type Partial = ();
    type FieldEntry = ();
    type Object = ();
    type Output = BTreeSet<ChangedKey>;

    fn accept_scalar(&self, _value: &Value, _info: &FieldInfo<'_>) -> Result<(), CacheError> {
        Ok(())
    }

    fn accept_null(&self, _info: &FieldInfo<'_>) -> Result<(), CacheError> {
        Ok(())
    }

    fn accept_list(&self, _items: Vec<()>, _info: &FieldInfo<'_>) -> Result<(), CacheError> {
        Ok(())
    }

    fn accept_child_object(&self, _object: (), _info: &FieldInfo<'_>) -> Result<(), CacheError> {
        Ok(())
    }

    fn accept_field_entry(&self, _value: (), _info: &FieldInfo<'_>) -> Result<Option<()>, CacheError> {
        Ok(None)
    }

    fn accept_field_entries(&self, _entries: Vec<()>, _info: &ObjectInfo) -> Result<(), CacheError> {
        Ok(())
    }

    fn finish(&self, _root: (), _info: &ObjectInfo) -> Result<BTreeSet<ChangedKey>, CacheError> {
        Ok(self.keys.take())
    }

    fn enter_field(&self, info: &FieldInfo<'_>) {
        self.keys.borrow_mut().insert(ChangedKey::new(info.parent_key.clone(), info.storage_key.clone()));
    }
}
