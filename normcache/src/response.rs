use crate::error::CacheError;
use crate::execution::accumulators::{DependencyTracker, JsonCollector, Normalizer};
use crate::execution::sources::JsonSource;
use crate::execution::Executor;
use crate::key_resolver::CacheKeyResolver;
use crate::record::{CacheKey, ChangedKey, RecordSet};
use crate::selection::{SchemaMetadata, SelectionSet, Variables};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;

#[derive(Debug)]
pub struct ParsedResponse {
    /// The response data as selected, keyed by response keys.
    pub data: JsonValue,
    /// Normalized delta ready to be merged.
    pub records: RecordSet,
    /// Every `(record, field)` the response covers.
    pub dependent_keys: BTreeSet<ChangedKey>,
    /// Resolution errors absorbed at nullable positions.
    pub errors: Vec<CacheError>,
}

/// Walks `data` once, producing its plain JSON, its normalized records and its dependent
/// keys together.
pub fn parse_response(
    data: &Map<String, JsonValue>,
    selections: &SelectionSet,
    root_key: CacheKey,
    variables: &Variables,
    resolver: &dyn CacheKeyResolver,
    schema: &dyn SchemaMetadata,
) -> Result<ParsedResponse, CacheError> {
    let source = JsonSource::new(resolver);
    let executor = Executor::new(&source, schema, variables);
    let accumulator = (JsonCollector, Normalizer::default(), DependencyTracker::default());
    let output = executor.execute(selections, data, root_key, &accumulator)?;
    let (data, records, dependent_keys) = output.value;
    log::debug!("parsed response into {} records, {} dependent keys", records.len(), dependent_keys.len());
    Ok(ParsedResponse { data, records, dependent_keys, errors: output.errors })
}

/// Normalization only.
pub fn normalize(
    data: &Map<String, JsonValue>,
    selections: &SelectionSet,
    root_key: CacheKey,
    variables: &Variables,
    resolver: &dyn CacheKeyResolver,
    schema: &dyn SchemaMetadata,
) -> Result<RecordSet, CacheError> {
    let source = JsonSource::new(resolver);
    let executor = Executor::new(&source, schema, variables);
    Ok(executor.execute(selections, data, root_key, &Normalizer::default())?.value)
}
