use crate::batch_loader::RecordLoader;
use crate::coordinator::ReadWriteCoordinator;
use crate::error::CacheError;
use crate::execution::accumulators::{JsonCollector, TypedCollector};
use crate::execution::sources::CacheSource;
use crate::execution::{Accumulator, ExecutionOutput, Executor};
use crate::key_resolver::{CacheKeyResolver, IdFieldResolver};
use crate::logger;
use crate::persistence::lru::LruBackend;
use crate::persistence::memory::MemoryBackend;
use crate::persistence::redb::RedbBackend;
use crate::persistence::sqlite::SqliteBackend;
use crate::persistence::{KeyPattern, PersistenceBackend};
use crate::record::{CacheKey, ChangedKey, ChangedKeys, Record, RecordSet};
use crate::response::parse_response;
use crate::selection::{SchemaMetadata, SchemaTypes, SelectionSet, Variables};
use crate::settings::{BackendKind, CacheSettings};
use crate::{info, warn};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANGE_FEED_CAPACITY: usize = 64;

type Backend = Box<dyn PersistenceBackend>;

/// Result of [`Store::publish`].
#[derive(Debug)]
pub struct Published {
    /// The response as selected, keyed by response keys.
    pub data: JsonValue,
    /// Fields the merge actually altered.
    pub changed: ChangedKeys,
    /// Every `(record, field)` the response covers; a watcher of this response re-runs
    /// when a later change affects one of them.
    pub dependent_keys: BTreeSet<ChangedKey>,
    /// Resolution errors absorbed at nullable positions.
    pub errors: Vec<CacheError>,
}

#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    pub reachable: usize,
    pub removed: Vec<CacheKey>,
    /// Rows that could not be decoded; they are left in place.
    pub skipped: Vec<CacheKey>,
}

/// The normalized cache: an authoritative record store behind a read/write coordinator.
///
/// Merges are exclusive and atomic: the delta is merged into a staging copy of the
/// affected records and only the records that changed are written, in one backend
/// upsert. Reads run concurrently with each other and never observe a merge halfway.
pub struct Store {
    coordinator: ReadWriteCoordinator<Backend>,
    resolver: Arc<dyn CacheKeyResolver>,
    schema: Arc<dyn SchemaMetadata>,
    changes: broadcast::Sender<ChangedKeys>,
    vacuum_on_clear: bool,
}

fn with_lru<B: PersistenceBackend + 'static>(backend: B, capacity: usize) -> Backend {
    match NonZeroUsize::new(capacity) {
        Some(capacity) => Box::new(LruBackend::new(backend, capacity)),
        None => Box::new(backend),
    }
}

fn required_path(settings: &CacheSettings) -> Result<&PathBuf, CacheError> {
    settings
        .store
        .path
        .as_ref()
        .ok_or_else(|| CacheError::custom(format!("store.path is required by the {:?} backend", settings.store.backend)))
}

impl Store {
    pub fn open(settings: &CacheSettings) -> Result<Self, CacheError> {
        logger::set_level(settings.log.level);
        let backend: Backend = match settings.store.backend {
            BackendKind::Memory => Box::new(MemoryBackend::new()),
            BackendKind::Sqlite => with_lru(SqliteBackend::open(required_path(settings)?)?, settings.store.lru_capacity),
            BackendKind::Redb => with_lru(RedbBackend::open(required_path(settings)?)?, settings.store.lru_capacity),
        };
        let mut store = Store::with_backend(backend)?;
        store.resolver = Arc::new(IdFieldResolver::from_settings(&settings.normalization));
        store.vacuum_on_clear = settings.store.vacuum_on_clear;
        Ok(store)
    }

    pub fn new(backend: impl PersistenceBackend + 'static) -> Result<Self, CacheError> {
        Store::with_backend(Box::new(backend))
    }

    pub fn in_memory() -> Self {
        Store::assemble(Box::new(MemoryBackend::new()))
    }

    fn with_backend(mut backend: Backend) -> Result<Self, CacheError> {
        backend.create_schema_if_needed()?;
        info!("normcache store opened on {} backend", backend.name());
        Ok(Store::assemble(backend))
    }

    fn assemble(backend: Backend) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            coordinator: ReadWriteCoordinator::new(backend),
            resolver: Arc::new(IdFieldResolver::default()),
            schema: Arc::new(SchemaTypes::new()),
            changes,
            vacuum_on_clear: false,
        }
    }

    pub fn with_resolver(mut self, resolver: impl CacheKeyResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_schema(mut self, schema: impl SchemaMetadata + 'static) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    /// Receives the changed keys of every merge that altered something.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangedKeys> {
        self.changes.subscribe()
    }

    /// Runs `body` on the blocking pool under shared access.
    async fn with_read<R: Send + 'static>(
        &self,
        body: impl FnOnce(&dyn PersistenceBackend) -> Result<R, CacheError> + Send + 'static,
    ) -> Result<R, CacheError> {
        let permit = self.coordinator.lock_read().await?;
        tokio::task::spawn_blocking(move || body(&**permit)).await?
    }

    /// Runs `body` on the blocking pool under exclusive access.
    async fn with_write<R: Send + 'static>(
        &self,
        body: impl FnOnce(&mut dyn PersistenceBackend) -> Result<R, CacheError> + Send + 'static,
    ) -> Result<R, CacheError> {
        let mut permit = self.coordinator.lock_write().await?;
        tokio::task::spawn_blocking(move || body(&mut **permit)).await?
    }

    /// Field-level merge of `delta`; returns exactly the fields whose value changed.
    pub async fn merge(&self, delta: RecordSet) -> Result<ChangedKeys, CacheError> {
        if delta.is_empty() {
            return Ok(ChangedKeys::new());
        }
        let changed = self.with_write(move |backend| merge_into(backend, delta)).await?;
        if !changed.is_empty() {
            // no subscribers is fine
            let _ = self.changes.send(changed.clone());
        }
        Ok(changed)
    }

    /// Normalizes a response for `selections` and merges it.
    pub async fn publish(
        &self,
        response: &Map<String, JsonValue>,
        selections: &SelectionSet,
        root_key: CacheKey,
        variables: &Variables,
    ) -> Result<Published, CacheError> {
        let parsed = parse_response(response, selections, root_key, variables, &*self.resolver, &*self.schema)?;
        let changed = self.merge(parsed.records).await?;
        Ok(Published { data: parsed.data, changed, dependent_keys: parsed.dependent_keys, errors: parsed.errors })
    }

    /// Reads `selections` from `root_key` into `accumulator` under shared access.
    pub async fn read<A>(
        &self,
        selections: &SelectionSet,
        root_key: CacheKey,
        variables: &Variables,
        accumulator: A,
    ) -> Result<ExecutionOutput<A::Output>, CacheError>
    where
        A: Accumulator + Send + 'static,
        A::Output: Send + 'static,
    {
        self.read_checked(None, selections, root_key, variables, accumulator).await
    }

    /// Like [`Store::read`] but fails with `InvalidObjectType` unless the root record's
    /// type satisfies `type_condition`.
    pub async fn read_as<A>(
        &self,
        type_condition: &str,
        selections: &SelectionSet,
        root_key: CacheKey,
        variables: &Variables,
        accumulator: A,
    ) -> Result<ExecutionOutput<A::Output>, CacheError>
    where
        A: Accumulator + Send + 'static,
        A::Output: Send + 'static,
    {
        self.read_checked(Some(type_condition.to_string()), selections, root_key, variables, accumulator).await
    }

    async fn read_checked<A>(
        &self,
        type_condition: Option<String>,
        selections: &SelectionSet,
        root_key: CacheKey,
        variables: &Variables,
        accumulator: A,
    ) -> Result<ExecutionOutput<A::Output>, CacheError>
    where
        A: Accumulator + Send + 'static,
        A::Output: Send + 'static,
    {
        let schema = self.schema.clone();
        let selections = selections.clone();
        let variables = variables.clone();
        self.with_read(move |backend| {
            execute_read(backend, &*schema, type_condition.as_deref(), &selections, root_key, &variables, &accumulator)
        })
        .await
    }

    pub async fn read_json(&self, selections: &SelectionSet, root_key: CacheKey, variables: &Variables) -> Result<ExecutionOutput<JsonValue>, CacheError> {
        self.read(selections, root_key, variables, JsonCollector).await
    }

    pub async fn read_typed<T: DeserializeOwned + Send + 'static>(
        &self,
        selections: &SelectionSet,
        root_key: CacheKey,
        variables: &Variables,
    ) -> Result<ExecutionOutput<T>, CacheError> {
        self.read(selections, root_key, variables, TypedCollector::<T>::default()).await
    }

    /// Records for `keys` in order, `None` where absent. A stored row that fails to decode
    /// fails the call.
    pub async fn load_records(&self, keys: &[CacheKey]) -> Result<Vec<Option<Record>>, CacheError> {
        let keys = keys.to_vec();
        self.with_read(move |backend| {
            let mut found: HashMap<CacheKey, Record> = HashMap::with_capacity(keys.len());
            for (_key, row) in backend.select(&keys)? {
                let record = row?;
                found.insert(record.key().clone(), record);
            }
            Ok(keys.iter().map(|key| found.remove(key)).collect())
        })
        .await
    }

    pub async fn remove_record(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let key = key.clone();
        self.with_write(move |backend| backend.delete(&key)).await
    }

    pub async fn remove_records(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let pattern = pattern.clone();
        self.with_write(move |backend| {
            let removed = backend.delete_matching(&pattern)?;
            info!("removed {} records matching {}", removed, pattern.as_str());
            Ok(removed)
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        let vacuum = self.vacuum_on_clear;
        self.with_write(move |backend| {
            backend.clear(vacuum)?;
            info!("cleared {} store", backend.name());
            Ok(())
        })
        .await
    }

    pub async fn record_count(&self) -> Result<usize, CacheError> {
        self.with_read(|backend| backend.record_count()).await
    }

    /// Deletes every record not reachable from `roots` through references.
    pub async fn sweep(&self, roots: &[CacheKey]) -> Result<SweepReport, CacheError> {
        let roots = roots.to_vec();
        self.with_write(move |backend| sweep_unreachable(backend, &roots)).await
    }

    /// `(running readers, writer active, queued waiters)` of the coordinator.
    pub fn access_status(&self) -> (usize, bool, usize) {
        self.coordinator.status()
    }

    /// Consumes the store and closes its backend. Fails while a read or write still holds
    /// the backend.
    pub fn close(self) -> Result<(), CacheError> {
        let backend = self.coordinator.into_inner()?;
        info!("closing {} store", backend.name());
        drop(backend);
        Ok(())
    }
}

fn sweep_unreachable(backend: &mut dyn PersistenceBackend, roots: &[CacheKey]) -> Result<SweepReport, CacheError> {
    let mut edges: HashMap<CacheKey, Vec<CacheKey>> = HashMap::new();
    let mut report = SweepReport::default();
    for (key, row) in backend.select_all()? {
        match row {
            Ok(record) => {
                let targets = record.references().into_iter().cloned().collect();
                edges.insert(key, targets);
            }
            Err(e) => {
                warn!("sweep skipping undecodable record: {}", e);
                report.skipped.push(key);
            }
        }
    }

    let mut marked: HashSet<&CacheKey> = HashSet::new();
    let mut queue: VecDeque<&CacheKey> = roots.iter().collect();
    while let Some(key) = queue.pop_front() {
        if let Some((key, targets)) = edges.get_key_value(key) {
            if marked.insert(key) {
                queue.extend(targets.iter());
            }
        }
    }
    report.reachable = marked.len();
    let mut unreachable: Vec<CacheKey> = edges.keys().filter(|key| !marked.contains(key)).cloned().collect();
    unreachable.sort();
    backend.delete_many(&unreachable)?;
    report.removed = unreachable;
    info!("sweep kept {} records, removed {}, skipped {}", report.reachable, report.removed.len(), report.skipped.len());
    Ok(report)
}

fn merge_into(backend: &mut dyn PersistenceBackend, delta: RecordSet) -> Result<ChangedKeys, CacheError> {
    let keys: Vec<CacheKey> = delta.keys().cloned().collect();
    let mut staging = RecordSet::new();
    for (key, row) in backend.select(&keys)? {
        match row {
            Ok(record) => {
                staging.insert(record);
            }
            Err(e) => warn!("replacing undecodable record {}: {}", key, e),
        }
    }
    let changed = staging.merge(delta);
    let dirty: Vec<Record> = changed.record_keys().iter().filter_map(|key| staging.get(key.as_str()).cloned()).collect();
    log::debug!("merge touched {} records, {} changed fields", dirty.len(), changed.len());
    backend.upsert(dirty)?;
    Ok(changed)
}

fn execute_read<A: Accumulator>(
    backend: &dyn PersistenceBackend,
    schema: &dyn SchemaMetadata,
    type_condition: Option<&str>,
    selections: &SelectionSet,
    root_key: CacheKey,
    variables: &Variables,
    accumulator: &A,
) -> Result<ExecutionOutput<A::Output>, CacheError> {
    let loader = RecordLoader::new(|keys: &[CacheKey]| {
        Ok(backend.select(keys)?.into_iter().map(|(key, row)| (key, row.map(Arc::new))).collect())
    });
    let source = CacheSource::new(&loader);
    let root = source.root(&root_key)?;
    let executor = Executor::new(&source, schema, variables);
    let output = match type_condition {
        Some(type_condition) => executor.execute_as(type_condition, selections, root, root_key, accumulator)?,
        None => executor.execute(selections, root, root_key, accumulator)?,
    };
    log::debug!("read completed in {} batches with {} absorbed errors", loader.batch_count(), output.errors.len());
    Ok(output)
}
