//! normcache is a client-side normalized object cache for GraphQL-style query results.
//!
//! Response trees are flattened into [`Record`]s keyed by [`CacheKey`], with nested entities
//! replaced by references. Merging a response reports exactly the `(record, field)` pairs
//! whose value changed. Reads walk a [`SelectionSet`] back over the records, batching
//! record loads per object and per list, and feed one or several accumulators in a single
//! traversal. Records live in memory or in a SQLite or redb file.

pub mod logger;
pub mod error;
pub mod record;
pub mod settings;
pub mod key_resolver;
pub mod selection;
pub mod deferred;
pub mod batch_loader;
pub mod execution;
pub mod response;
pub mod coordinator;
pub mod persistence;
pub mod store;

pub use batch_loader::{BatchLoader, RecordLoader};
pub use coordinator::{ReadPermit, ReadWriteCoordinator, WritePermit};
pub use deferred::DeferredValue;
pub use error::{CacheError, RecordCodecError};
pub use execution::accumulators::{DependencyTracker, JsonCollector, Normalizer, TypedCollector};
pub use execution::sources::{CacheSource, JsonSource};
pub use execution::{Accumulator, ExecutionOutput, ExecutionSource, Executor, FieldInfo, ObjectInfo, PathSegment, ResponsePath, SourceValue};
pub use key_resolver::{path_key, CacheKeyResolver, IdFieldResolver};
pub use persistence::lru::LruBackend;
pub use persistence::memory::MemoryBackend;
pub use persistence::redb::RedbBackend;
pub use persistence::sqlite::SqliteBackend;
pub use persistence::{decode_record, encode_record, KeyPattern, PersistenceBackend};
pub use record::{CacheKey, ChangedKey, ChangedKeys, Record, RecordSet, Scalar, Value};
pub use response::{normalize, parse_response, ParsedResponse};
pub use selection::{
    Conditional, Field, FieldType, Fragment, InclusionCondition, InputValue, SchemaMetadata, SchemaTypes, Selection, SelectionSet, TypeCase,
    Variables,
};
pub use settings::{BackendKind, CacheSettings};
pub use store::{Published, Store, SweepReport};

pub use chrono;
pub use redb;
pub use rusqlite;
pub use serde;
pub use serde_json;
pub use tokio;
