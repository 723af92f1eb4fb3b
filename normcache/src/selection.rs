//! Read-only description of what to read or write: fields, type cases, fragment spreads
//! and `@include`/`@skip` conditionals, plus the schema's type-membership lookup.
//!
//! Selection sets are built once per operation (normally by generated code) and shared
//! across executions behind `Arc`s.

use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

pub type Variables = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Literal(JsonValue),
    Variable(String),
    List(Vec<InputValue>),
    Object(BTreeMap<String, InputValue>),
}

impl InputValue {
    pub fn variable(name: impl Into<String>) -> Self {
        InputValue::Variable(name.into())
    }

    /// Substitutes variables. `None` when the value is a variable the caller did not define.
    pub fn resolve(&self, variables: &Variables) -> Option<JsonValue> {
        match self {
            InputValue::Literal(v) => Some(v.clone()),
            InputValue::Variable(name) => variables.get(name).cloned(),
            InputValue::List(items) => Some(JsonValue::Array(
                items.iter().map(|i| i.resolve(variables).unwrap_or(JsonValue::Null)).collect(),
            )),
            InputValue::Object(fields) => Some(JsonValue::Object(
                fields.iter().filter_map(|(k, v)| v.resolve(variables).map(|v| (k.clone(), v))).collect(),
            )),
        }
    }
}

impl From<JsonValue> for InputValue {
    fn from(value: JsonValue) -> Self {
        InputValue::Literal(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    NonNull(Box<FieldType>),
    List(Box<FieldType>),
    Scalar(String),
    Object(Arc<SelectionSet>),
}

impl FieldType {
    pub fn non_null(inner: FieldType) -> Self {
        FieldType::NonNull(Box::new(inner))
    }

    pub fn list(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        FieldType::Scalar(name.into())
    }

    pub fn object(selections: SelectionSet) -> Self {
        FieldType::Object(Arc::new(selections))
    }

    pub fn is_nullable(&self) -> bool {
        !matches!(self, FieldType::NonNull(_))
    }

    /// Selection set of the innermost named type, if it is an object type.
    pub fn selections(&self) -> Option<&Arc<SelectionSet>> {
        match self {
            FieldType::NonNull(inner) | FieldType::List(inner) => inner.selections(),
            FieldType::Object(set) => Some(set),
            FieldType::Scalar(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub arguments: BTreeMap<String, InputValue>,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self { name: name.into(), alias: None, arguments: BTreeMap::new(), field_type }
    }

    pub fn typename() -> Self {
        Field::new("__typename", FieldType::non_null(FieldType::scalar("String")))
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Key the field's value is stored under: the bare name, or `name(<args>)` where `<args>`
    /// is the resolved argument object as compact JSON with sorted keys. Arguments bound to
    /// undefined variables are left out.
    pub fn storage_key(&self, variables: &Variables) -> String {
        if self.arguments.is_empty() {
            return self.name.clone();
        }
        let args: Map<String, JsonValue> = self
            .arguments
            .iter()
            .filter_map(|(k, v)| v.resolve(variables).map(|v| (k.clone(), v)))
            .collect();
        if args.is_empty() {
            self.name.clone()
        } else {
            format!("{}({})", self.name, JsonValue::Object(args))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeCase {
    pub type_condition: String,
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub name: String,
    pub type_condition: String,
    pub selections: Vec<Selection>,
}

impl Fragment {
    pub fn new(name: impl Into<String>, type_condition: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self { name: name.into(), type_condition: type_condition.into(), selections }
    }
}

/// `@include(if: $variable)` or, inverted, `@skip(if: $variable)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionCondition {
    pub variable: String,
    pub inverted: bool,
}

impl InclusionCondition {
    pub fn include(variable: impl Into<String>) -> Self {
        Self { variable: variable.into(), inverted: false }
    }

    pub fn skip(variable: impl Into<String>) -> Self {
        Self { variable: variable.into(), inverted: true }
    }

    /// An undefined or non-boolean variable reads as `false`.
    pub fn is_satisfied(&self, variables: &Variables) -> bool {
        let value = variables.get(&self.variable).and_then(JsonValue::as_bool).unwrap_or(false);
        value != self.inverted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conditional {
    pub conditions: Vec<InclusionCondition>,
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Field(Field),
    TypeCase(TypeCase),
    Fragment(Arc<Fragment>),
    Conditional(Conditional),
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Selection::Field(field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionSet {
    pub parent_type: String,
    pub selections: Vec<Selection>,
}

impl SelectionSet {
    pub fn new(parent_type: impl Into<String>) -> Self {
        Self { parent_type: parent_type.into(), selections: Vec::new() }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.selections.push(Selection::Field(field));
        self
    }

    pub fn type_case(mut self, type_condition: impl Into<String>, selections: Vec<Selection>) -> Self {
        self.selections.push(Selection::TypeCase(TypeCase { type_condition: type_condition.into(), selections }));
        self
    }

    pub fn fragment(mut self, fragment: Arc<Fragment>) -> Self {
        self.selections.push(Selection::Fragment(fragment));
        self
    }

    pub fn conditional(mut self, conditions: Vec<InclusionCondition>, selections: Vec<Selection>) -> Self {
        self.selections.push(Selection::Conditional(Conditional { conditions, selections }));
        self
    }
}

/// Type membership supplied by the schema.
pub trait SchemaMetadata: Send + Sync {
    /// Whether a concrete `object_type` satisfies `type_condition` (itself, an interface it
    /// implements, or a union containing it).
    fn satisfies(&self, object_type: &str, type_condition: &str) -> bool;
}

/// Interface and union membership tables. With no entries only exact matches satisfy.
#[derive(Debug, Clone, Default)]
pub struct SchemaTypes {
    interfaces: HashMap<String, HashSet<String>>,
    unions: HashMap<String, HashSet<String>>,
}

impl SchemaTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interface<I, S>(mut self, name: impl Into<String>, implementations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces.entry(name.into()).or_default().extend(implementations.into_iter().map(Into::into));
        self
    }

    pub fn union<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unions.entry(name.into()).or_default().extend(members.into_iter().map(Into::into));
        self
    }
}

impl SchemaMetadata for SchemaTypes {
    fn satisfies(&self, object_type: &str, type_condition: &str) -> bool {
        object_type == type_condition
            || self.interfaces.get(type_condition).is_some_and(|types| types.contains(object_type))
            || self.unions.get(type_condition).is_some_and(|types| types.contains(object_type))
    }
}
