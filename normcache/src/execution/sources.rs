use super::{ExecutionSource, FieldInfo, SourceValue};
use crate::batch_loader::RecordLoader;
use crate::deferred::DeferredValue;
use crate::error::CacheError;
use crate::key_resolver::CacheKeyResolver;
use crate::record::{CacheKey, Record, Value};
use crate::selection::FieldType;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// A decoded response tree. Fields are read by response key and always resolve immediately.
pub struct JsonSource<'a> {
    resolver: &'a dyn CacheKeyResolver,
}

impl<'a> JsonSource<'a> {
    pub fn new(resolver: &'a dyn CacheKeyResolver) -> Self {
        Self { resolver }
    }
}

fn shape_json<'a>(value: &'a JsonValue, field_type: &FieldType) -> SourceValue<'a, &'a Map<String, JsonValue>> {
    match (value, field_type) {
        (JsonValue::Null, _) => SourceValue::Null,
        (_, FieldType::NonNull(inner)) => shape_json(value, inner),
        (JsonValue::Array(items), FieldType::List(inner)) => SourceValue::List(items.iter().map(|item| shape_json(item, inner)).collect()),
        (JsonValue::Object(fields), FieldType::Object(_)) => SourceValue::Object(DeferredValue::immediate(fields)),
        (other, _) => SourceValue::Scalar(Value::from_json(other)),
    }
}

impl<'a> ExecutionSource<'a> for JsonSource<'a> {
    type Object = &'a Map<String, JsonValue>;

    fn typename(&self, object: &Self::Object) -> Option<String> {
        object.get("__typename").and_then(JsonValue::as_str).map(str::to_string)
    }

    fn object_key(&self, object: &Self::Object, typename: &str) -> Option<CacheKey> {
        self.resolver.resolve(typename, object)
    }

    fn resolve_field(&self, object: &Self::Object, info: &FieldInfo<'_>) -> DeferredValue<'a, Option<SourceValue<'a, Self::Object>>> {
        let object: &'a Map<String, JsonValue> = *object;
        DeferredValue::immediate(object.get(info.response_key).map(|value| shape_json(value, &info.field.field_type)))
    }
}

/// Stored records. Fields are read by storage key; references go through the loader so
/// that all references met while completing one object or list are fetched together.
pub struct CacheSource<'a> {
    loader: &'a RecordLoader<'a>,
}

impl<'a> CacheSource<'a> {
    pub fn new(loader: &'a RecordLoader<'a>) -> Self {
        Self { loader }
    }

    /// Loads `key` through the loader; a missing record is `MissingRoot`.
    pub fn root(&self, key: &CacheKey) -> Result<Arc<Record>, CacheError> {
        match self.loader.get(key.clone()).get()? {
            Some(Ok(record)) => Ok(record),
            Some(Err(e)) => Err(e.into()),
            None => Err(CacheError::MissingRoot(key.clone())),
        }
    }

    fn shape(&self, value: &Value, field_type: &FieldType, info: &FieldInfo<'_>) -> SourceValue<'a, Arc<Record>> {
        match (value, field_type) {
            (Value::Null, _) => SourceValue::Null,
            (_, FieldType::NonNull(inner)) => self.shape(value, inner, info),
            (Value::List(items), FieldType::List(inner)) => {
                SourceValue::List(items.iter().enumerate().map(|(i, item)| self.shape(item, inner, &info.element(i))).collect())
            }
            (Value::Reference(key), FieldType::Object(_)) => {
                let path = info.path.clone();
                SourceValue::Object(self.loader.get(key.clone()).try_map(move |found| match found {
                    Some(Ok(record)) => Ok(record),
                    Some(Err(e)) => Err(e.into()),
                    None => Err(CacheError::MissingValue { path }),
                }))
            }
            (Value::Object(fields), FieldType::Object(_)) => {
                let embedded = Record::with_fields(info.cache_path.clone(), fields.clone());
                SourceValue::Object(DeferredValue::immediate(Arc::new(embedded)))
            }
            (other, _) => SourceValue::Scalar(other.clone()),
        }
    }
}

impl<'a> ExecutionSource<'a> for CacheSource<'a> {
    type Object = Arc<Record>;

    fn typename(&self, object: &Self::Object) -> Option<String> {
        object.typename().map(str::to_string)
    }

    fn object_key(&self, object: &Self::Object, _typename: &str) -> Option<CacheKey> {
        Some(object.key().clone())
    }

    fn resolve_field(&self, object: &Self::Object, info: &FieldInfo<'_>) -> DeferredValue<'a, Option<SourceValue<'a, Self::Object>>> {
        DeferredValue::immediate(object.get(&info.storage_key).map(|value| self.shape(value, &info.field.field_type, info)))
    }
}
