use crate::record::CacheKey;
use crate::settings::NormalizationSettings;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// Maps an object to its stable identity. `None` means the object has no identity and
/// gets a path key under its parent instead.
///
/// Implementations must be pure: the same `(typename, fields)` always yields the same key.
pub trait CacheKeyResolver: Send + Sync {
    fn resolve(&self, typename: &str, fields: &Map<String, JsonValue>) -> Option<CacheKey>;
}

impl<F> CacheKeyResolver for F
where
    F: Fn(&str, &Map<String, JsonValue>) -> Option<CacheKey> + Send + Sync,
{
    fn resolve(&self, typename: &str, fields: &Map<String, JsonValue>) -> Option<CacheKey> {
        self(typename, fields)
    }
}

/// Key `{parent}.{storage_key}` or `{parent}.{storage_key}.{index}` for list entries.
pub fn path_key(parent: &CacheKey, storage_key: &str, index: Option<usize>) -> CacheKey {
    match index {
        Some(i) => CacheKey::new(format!("{}.{}.{}", parent, storage_key, i)),
        None => parent.child(storage_key),
    }
}

/// `"{typename}:{id}"` policy.
///
/// `key_fields` are candidates tried in order, the first present one wins. A type listed in
/// `type_key_fields` instead requires all of its fields, joined with `/` (composite keys).
#[derive(Debug, Clone)]
pub struct IdFieldResolver {
    key_fields: Vec<String>,
    type_key_fields: HashMap<String, Vec<String>>,
}

impl Default for IdFieldResolver {
    fn default() -> Self {
        Self { key_fields: vec!["id".to_string()], type_key_fields: HashMap::new() }
    }
}

impl IdFieldResolver {
    pub fn new(key_fields: Vec<String>) -> Self {
        Self { key_fields, type_key_fields: HashMap::new() }
    }

    pub fn with_type_key_fields(mut self, typename: impl Into<String>, fields: Vec<String>) -> Self {
        self.type_key_fields.insert(typename.into(), fields);
        self
    }

    pub fn from_settings(settings: &NormalizationSettings) -> Self {
        Self { key_fields: settings.key_fields.clone(), type_key_fields: settings.type_key_fields.clone() }
    }

    fn component(value: &JsonValue) -> Option<String> {
        match value {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl CacheKeyResolver for IdFieldResolver {
    fn resolve(&self, typename: &str, fields: &Map<String, JsonValue>) -> Option<CacheKey> {
        let id = match self.type_key_fields.get(typename) {
            Some(composite) if !composite.is_empty() => {
                let parts = composite
                    .iter()
                    .map(|f| fields.get(f).and_then(Self::component))
                    .collect::<Option<Vec<String>>>()?;
                parts.join("/")
            }
            _ => self.key_fields.iter().find_map(|f| fields.get(f).and_then(Self::component))?,
        };
        Some(CacheKey::new(format!("{}:{}", typename, id)))
    }
}
