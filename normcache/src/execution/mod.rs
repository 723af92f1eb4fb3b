//! Selection-driven traversal.
//!
//! An [`Executor`] walks a [`SelectionSet`] over an [`ExecutionSource`] and feeds an
//! [`Accumulator`]. Tuples of accumulators are accumulators themselves, so one walk can
//! produce normalized records, plain JSON and a dependency set together.
//!
//! Objects are processed in three steps: every field of the object is requested from the
//! source, then every requested value is forced, then values are completed depth first.
//! A batched source therefore fetches all references of one object, or of one list, in a
//! single round trip.

pub mod accumulators;
pub mod sources;
#[cfg(test)]
mod tests;

use crate::deferred::DeferredValue;
use crate::error::CacheError;
use crate::key_resolver::path_key;
use crate::record::{CacheKey, Value};
use crate::selection::{Field, FieldType, SchemaMetadata, Selection, SelectionSet, Variables};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location in the response tree, e.g. `hero.friends.1.name`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponsePath(Vec<PathSegment>);

impl ResponsePath {
    pub fn root() -> Self {
        ResponsePath(Vec::new())
    }

    pub fn key(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.to_string()));
        ResponsePath(segments)
    }

    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        ResponsePath(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }
}

impl fmt::Display for ResponsePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                PathSegment::Key(key) => f.write_str(key)?,
                PathSegment::Index(index) => write!(f, "{}", index)?,
            }
        }
        Ok(())
    }
}

/// Field being completed.
#[derive(Clone, Debug)]
pub struct FieldInfo<'s> {
    pub field: &'s Field,
    pub response_key: &'s str,
    /// Storage key with variables substituted.
    pub storage_key: String,
    pub parent_key: CacheKey,
    pub parent_type: String,
    pub path: ResponsePath,
    /// Key an identity-less object at this position is stored under.
    pub cache_path: CacheKey,
}

impl<'s> FieldInfo<'s> {
    /// The same field at list position `index`.
    pub fn element(&self, index: usize) -> FieldInfo<'s> {
        FieldInfo {
            path: self.path.index(index),
            cache_path: self.cache_path.child(index),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjectInfo {
    pub key: CacheKey,
    pub typename: String,
    pub path: ResponsePath,
}

/// Raw value of one field as the source sees it, shaped by the field's type.
pub enum SourceValue<'a, O> {
    Null,
    Scalar(Value),
    List(Vec<SourceValue<'a, O>>),
    Object(DeferredValue<'a, O>),
}

/// Where the executor reads from.
pub trait ExecutionSource<'a> {
    type Object: 'a;

    fn typename(&self, object: &Self::Object) -> Option<String>;

    /// Identity of the object, `None` when it has none and lives under a path key.
    fn object_key(&self, object: &Self::Object, typename: &str) -> Option<CacheKey>;

    /// `None` when the field is absent on the object.
    fn resolve_field(&self, object: &Self::Object, info: &FieldInfo<'_>) -> DeferredValue<'a, Option<SourceValue<'a, Self::Object>>>;
}

/// Observer that builds one output during a traversal.
///
/// Callbacks come in completion order: a field's value is accepted (scalar, null, list or
/// child object), wrapped into a field entry, and an object's entries are folded into the
/// object once all its fields completed. Methods take `&self`; accumulators with state keep
/// it behind a `RefCell`.
pub trait Accumulator {
    type Partial;
    type FieldEntry;
    type Object;
    type Output;

    fn accept_scalar(&self, value: &Value, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError>;
    fn accept_null(&self, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError>;

    /// A nullable position without a value: the field is missing from the source, or its
    /// completion failed and was absorbed. Renders as null unless overridden.
    fn accept_absent(&self, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError> {
        self.accept_null(info)
    }

    fn accept_list(&self, items: Vec<Self::Partial>, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError>;
    fn accept_child_object(&self, object: Self::Object, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError>;
    fn accept_field_entry(&self, value: Self::Partial, info: &FieldInfo<'_>) -> Result<Option<Self::FieldEntry>, CacheError>;
    fn accept_field_entries(&self, entries: Vec<Self::FieldEntry>, info: &ObjectInfo) -> Result<Self::Object, CacheError>;
    fn finish(&self, root: Self::Object, info: &ObjectInfo) -> Result<Self::Output, CacheError>;

    fn enter_object(&self, _info: &ObjectInfo) {}

    /// Called before the field's value is completed, whether or not completion succeeds.
    fn enter_field(&self, _info: &FieldInfo<'_>) {}

    fn type_condition(&self, _type_condition: &str, _matched: bool, _info: &ObjectInfo) {}
}

macro_rules! fused_accumulator {
    ($($acc:ident $idx:tt $var:ident),+) => {
        impl<$($acc: Accumulator),+> Accumulator for ($($acc,)+) {
            type Partial = ($($acc::Partial,)+);
            type FieldEntry = ($(Option<$acc::FieldEntry>,)+);
            type Object = ($($acc::Object,)+);
            type Output = ($($acc::Output,)+);

            fn accept_scalar(&self, value: &Value, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError> {
                Ok(($(self.$idx.accept_scalar(value, info)?,)+))
            }

            fn accept_null(&self, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError> {
                Ok(($(self.$idx.accept_null(info)?,)+))
            }

            fn accept_absent(&self, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError> {
                Ok(($(self.$idx.accept_absent(info)?,)+))
            }

            fn accept_list(&self, items: Vec<Self::Partial>, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError> {
                $(let mut $var = Vec::with_capacity(items.len());)+
                for item in items {
                    $($var.push(item.$idx);)+
                }
                Ok(($(self.$idx.accept_list($var, info)?,)+))
            }

            fn accept_child_object(&self, object: Self::Object, info: &FieldInfo<'_>) -> Result<Self::Partial, CacheError> {
                Ok(($(self.$idx.accept_child_object(object.$idx, info)?,)+))
            }

            fn accept_field_entry(&self, value: Self::Partial, info: &FieldInfo<'_>) -> Result<Option<Self::FieldEntry>, CacheError> {
                Ok(Some(($(self.$idx.accept_field_entry(value.$idx, info)?,)+)))
            }

            fn accept_field_entries(&self, entries: Vec<Self::FieldEntry>, info: &ObjectInfo) -> Result<Self::Object, CacheError> {
                $(let mut $var = Vec::with_capacity(entries.len());)+
                for entry in entries {
                    $(if let Some(e) = entry.$idx { $var.push(e); })+
                }
                Ok(($(self.$idx.accept_field_entries($var, info)?,)+))
            }

            fn finish(&self, root: Self::Object, info: &ObjectInfo) -> Result<Self::Output, CacheError> {
                Ok(($(self.$idx.finish(root.$idx, info)?,)+))
            }

            fn enter_object(&self, info: &ObjectInfo) {
                $(self.$idx.enter_object(info);)+
            }

            fn enter_field(&self, info: &FieldInfo<'_>) {
                $(self.$idx.enter_field(info);)+
            }

            fn type_condition(&self, type_condition: &str, matched: bool, info: &ObjectInfo) {
                $(self.$idx.type_condition(type_condition, matched, info);)+
            }
        }
    };
}

fused_accumulator!(A 0 a, B 1 b);
fused_accumulator!(A 0 a, B 1 b, C 2 c);
fused_accumulator!(A 0 a, B 1 b, C 2 c, D 3 d);

#[derive(Debug)]
pub struct ExecutionOutput<T> {
    pub value: T,
    /// Resolution errors that were absorbed by nullable positions.
    pub errors: Vec<CacheError>,
}

struct FieldGroup<'s> {
    response_key: &'s str,
    fields: Vec<&'s Field>,
}

struct PreparedField<'s, 'a, O> {
    info: FieldInfo<'s>,
    field_type: &'s FieldType,
    children: Vec<&'s SelectionSet>,
    value: DeferredValue<'a, Option<SourceValue<'a, O>>>,
}

struct PreparedObject<'s, 'a, O> {
    info: ObjectInfo,
    fields: Vec<PreparedField<'s, 'a, O>>,
}

enum Staged<'s, 'a, O> {
    Absent,
    Null,
    Scalar(Value),
    List(Vec<Staged<'s, 'a, O>>),
    Object(PreparedObject<'s, 'a, O>),
    Failed(CacheError),
}

pub struct Executor<'x, 'a, S> {
    source: &'x S,
    schema: &'x dyn SchemaMetadata,
    variables: &'x Variables,
    errors: RefCell<Vec<CacheError>>,
    _source: PhantomData<fn() -> &'a ()>,
}

impl<'x, 'a, S: ExecutionSource<'a>> Executor<'x, 'a, S> {
    pub fn new(source: &'x S, schema: &'x dyn SchemaMetadata, variables: &'x Variables) -> Self {
        Self { source, schema, variables, errors: RefCell::new(Vec::new()), _source: PhantomData }
    }

    pub fn execute<A: Accumulator>(&self, selections: &SelectionSet, root: S::Object, root_key: CacheKey, accumulator: &A) -> Result<ExecutionOutput<A::Output>, CacheError> {
        let typename = self.source.typename(&root).unwrap_or_else(|| selections.parent_type.clone());
        let info = ObjectInfo { key: root_key, typename, path: ResponsePath::root() };
        self.run(selections, root, info, accumulator)
    }

    /// Like [`Executor::execute`] but fails with `InvalidObjectType` unless the root object
    /// satisfies `type_condition`.
    pub fn execute_as<A: Accumulator>(
        &self,
        type_condition: &str,
        selections: &SelectionSet,
        root: S::Object,
        root_key: CacheKey,
        accumulator: &A,
    ) -> Result<ExecutionOutput<A::Output>, CacheError> {
        let typename = self.source.typename(&root).unwrap_or_else(|| selections.parent_type.clone());
        if !self.schema.satisfies(&typename, type_condition) {
            return Err(CacheError::InvalidObjectType { expected: type_condition.to_string(), actual: typename });
        }
        let info = ObjectInfo { key: root_key, typename, path: ResponsePath::root() };
        self.run(selections, root, info, accumulator)
    }

    fn run<A: Accumulator>(&self, selections: &SelectionSet, root: S::Object, info: ObjectInfo, acc: &A) -> Result<ExecutionOutput<A::Output>, CacheError> {
        self.errors.borrow_mut().clear();
        let prepared = self.prepare_object(vec![selections], root, info.clone(), acc);
        let object = self.complete_object(prepared, acc)?;
        let value = acc.finish(object, &info)?;
        Ok(ExecutionOutput { value, errors: self.errors.take() })
    }

    fn collect_fields<'s, A: Accumulator>(&self, sets: &[&'s SelectionSet], info: &ObjectInfo, acc: &A) -> Vec<FieldGroup<'s>> {
        let mut groups = Vec::new();
        let mut index = HashMap::new();
        for &set in sets {
            self.collect_selections(&set.selections, info, acc, &mut groups, &mut index);
        }
        groups
    }

    fn collect_selections<'s, A: Accumulator>(
        &self,
        selections: &'s [Selection],
        info: &ObjectInfo,
        acc: &A,
        groups: &mut Vec<FieldGroup<'s>>,
        index: &mut HashMap<&'s str, usize>,
    ) {
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    let key = field.response_key();
                    match index.get(key) {
                        Some(&i) => groups[i].fields.push(field),
                        None => {
                            index.insert(key, groups.len());
                            groups.push(FieldGroup { response_key: key, fields: vec![field] });
                        }
                    }
                }
                Selection::TypeCase(case) => {
                    let matched = self.schema.satisfies(&info.typename, &case.type_condition);
                    acc.type_condition(&case.type_condition, matched, info);
                    if matched {
                        self.collect_selections(&case.selections, info, acc, groups, index);
                    }
                }
                Selection::Fragment(fragment) => {
                    let matched = self.schema.satisfies(&info.typename, &fragment.type_condition);
                    acc.type_condition(&fragment.type_condition, matched, info);
                    if matched {
                        self.collect_selections(&fragment.selections, info, acc, groups, index);
                    }
                }
                Selection::Conditional(conditional) => {
                    if conditional.conditions.iter().all(|c| c.is_satisfied(self.variables)) {
                        self.collect_selections(&conditional.selections, info, acc, groups, index);
                    }
                }
            }
        }
    }

    fn prepare_object<'s, A: Accumulator>(&self, sets: Vec<&'s SelectionSet>, object: S::Object, info: ObjectInfo, acc: &A) -> PreparedObject<'s, 'a, S::Object> {
        let groups = self.collect_fields(&sets, &info, acc);
        let mut fields = Vec::with_capacity(groups.len());
        for group in groups {
            let Some(&first) = group.fields.first() else { continue };
            let storage_key = first.storage_key(self.variables);
            let field_info = FieldInfo {
                field: first,
                response_key: group.response_key,
                cache_path: path_key(&info.key, &storage_key, None),
                storage_key,
                parent_key: info.key.clone(),
                parent_type: info.typename.clone(),
                path: info.path.key(group.response_key),
            };
            let children = group.fields.iter().filter_map(|f| f.field_type.selections().map(|s| s.as_ref())).collect();
            let value = self.source.resolve_field(&object, &field_info);
            fields.push(PreparedField { info: field_info, field_type: &first.field_type, children, value });
        }
        PreparedObject { info, fields }
    }

    fn prepare_child<'s, A: Accumulator>(&self, object: S::Object, children: &[&'s SelectionSet], info: &FieldInfo<'s>, acc: &A) -> PreparedObject<'s, 'a, S::Object> {
        let typename = self
            .source
            .typename(&object)
            .or_else(|| children.first().map(|s| s.parent_type.clone()))
            .unwrap_or_default();
        let key = self.source.object_key(&object, &typename).unwrap_or_else(|| info.cache_path.clone());
        let object_info = ObjectInfo { key, typename, path: info.path.clone() };
        self.prepare_object(children.to_vec(), object, object_info, acc)
    }

    fn stage<'s, A: Accumulator>(&self, value: SourceValue<'a, S::Object>, children: &[&'s SelectionSet], info: &FieldInfo<'s>, acc: &A) -> Staged<'s, 'a, S::Object> {
        match value {
            SourceValue::Null => Staged::Null,
            SourceValue::Scalar(value) => Staged::Scalar(value),
            SourceValue::List(items) => Staged::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| self.stage(item, children, &info.element(i), acc))
                    .collect(),
            ),
            SourceValue::Object(deferred) => match deferred.get() {
                Ok(object) => Staged::Object(self.prepare_child(object, children, info, acc)),
                Err(e) => Staged::Failed(e),
            },
        }
    }

    fn complete_object<'s, A: Accumulator>(&self, object: PreparedObject<'s, 'a, S::Object>, acc: &A) -> Result<A::Object, CacheError> {
        acc.enter_object(&object.info);
        let staged: Vec<_> = object
            .fields
            .into_iter()
            .map(|PreparedField { info, field_type, children, value }| {
                let staged = match value.get() {
                    Ok(Some(value)) => self.stage(value, &children, &info, acc),
                    Ok(None) => Staged::Absent,
                    Err(e) => Staged::Failed(e),
                };
                (info, field_type, staged)
            })
            .collect();

        let mut entries = Vec::with_capacity(staged.len());
        for (info, field_type, staged) in staged {
            acc.enter_field(&info);
            let partial = self.complete_value(staged, field_type, &info, acc)?;
            if let Some(entry) = acc.accept_field_entry(partial, &info)? {
                entries.push(entry);
            }
        }
        acc.accept_field_entries(entries, &object.info)
    }

    /// Completes a value at a position of type `field_type`. Resolution errors at nullable
    /// positions are recorded and completed as absent; anything else propagates.
    fn complete_value<'s, A: Accumulator>(&self, staged: Staged<'s, 'a, S::Object>, field_type: &FieldType, info: &FieldInfo<'s>, acc: &A) -> Result<A::Partial, CacheError> {
        let (nullable, inner) = match field_type {
            FieldType::NonNull(inner) => (false, inner.as_ref()),
            other => (true, other),
        };
        let result = match staged {
            Staged::Absent if nullable => return acc.accept_absent(info),
            Staged::Null if nullable => return acc.accept_null(info),
            Staged::Absent | Staged::Null => Err(CacheError::MissingValue { path: info.path.clone() }),
            other => self.complete_inner(other, inner, info, acc),
        };
        match result {
            Err(e) if nullable && e.is_resolution_error() => {
                log::debug!("{} completed as absent: {}", info.path, e);
                self.errors.borrow_mut().push(e);
                acc.accept_absent(info)
            }
            other => other,
        }
    }

    fn complete_inner<'s, A: Accumulator>(&self, staged: Staged<'s, 'a, S::Object>, field_type: &FieldType, info: &FieldInfo<'s>, acc: &A) -> Result<A::Partial, CacheError> {
        let unexpected = |expected: &'static str| CacheError::UnexpectedValue { path: info.path.clone(), expected };
        match (staged, field_type) {
            (staged, FieldType::NonNull(_)) => self.complete_value(staged, field_type, info, acc),
            (Staged::Failed(e), _) => Err(e),
            (Staged::Absent | Staged::Null, _) => Err(CacheError::MissingValue { path: info.path.clone() }),
            (Staged::Scalar(Value::Reference(_)), FieldType::Scalar(_)) => Err(unexpected("scalar")),
            (Staged::Scalar(value), FieldType::Scalar(_)) => acc.accept_scalar(&value, info),
            (Staged::List(items), FieldType::List(item_type)) => {
                let mut completed = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    completed.push(self.complete_value(item, item_type, &info.element(i), acc)?);
                }
                acc.accept_list(completed, info)
            }
            (Staged::Object(object), FieldType::Object(_)) => {
                let completed = self.complete_object(object, acc)?;
                acc.accept_child_object(completed, info)
            }
            (_, FieldType::List(_)) => Err(unexpected("list")),
            (_, FieldType::Object(_)) => Err(unexpected("object")),
            (_, FieldType::Scalar(_)) => Err(unexpected("scalar")),
        }
    }
}
