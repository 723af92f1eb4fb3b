use super::accumulators::{DependencyTracker, JsonCollector, Normalizer, TypedCollector};
use super::sources::CacheSource;
use super::*;
use crate::batch_loader::RecordLoader;
use crate::error::RecordCodecError;
use crate::record::{ChangedKey, Record, RecordSet};
use crate::selection::{Fragment, InclusionCondition, SchemaTypes};
use serde::Deserialize;
use serde_json::json;
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

fn store() -> RecordSet {
    let mut root = Record::new(CacheKey::QUERY_ROOT);
    root.insert("hero", Value::reference("Human:1000"));
    root.insert("droid", Value::reference("Droid:2001"));
    root.insert("ghost", Value::reference("Human:404"));
    let mut luke = Record::new("Human:1000");
    luke.insert("__typename", "Human");
    luke.insert("id", "1000");
    luke.insert("name", "Luke Skywalker");
    luke.insert("friends", Value::List(vec![Value::reference("Human:1002"), Value::reference("Human:1003"), Value::reference("Droid:2001")]));
    let mut han = Record::new("Human:1002");
    han.insert("__typename", "Human");
    han.insert("name", "Han Solo");
    let mut leia = Record::new("Human:1003");
    leia.insert("__typename", "Human");
    leia.insert("name", "Leia Organa");
    let mut r2 = Record::new("Droid:2001");
    r2.insert("__typename", "Droid");
    r2.insert("name", "R2-D2");
    r2.insert("primaryFunction", "Astromech");
    [root, luke, han, leia, r2].into_iter().collect()
}

fn loader<'a>(records: &'a RecordSet, batches: &'a RefCell<Vec<usize>>) -> RecordLoader<'a> {
    RecordLoader::new(move |keys: &[CacheKey]| {
        batches.borrow_mut().push(keys.len());
        Ok(keys
            .iter()
            .filter_map(|k| records.get(k.as_str()).map(|r| (k.clone(), Ok::<_, RecordCodecError>(Arc::new(r.clone())))))
            .collect::<HashMap<_, _>>())
    })
}

fn schema() -> SchemaTypes {
    SchemaTypes::new().interface("Character", ["Human", "Droid"])
}

fn name_only(parent: &str) -> SelectionSet {
    SelectionSet::new(parent).field(Field::new("name", FieldType::non_null(FieldType::scalar("String"))))
}

fn read_json(records: &RecordSet, query: &SelectionSet, variables: &Variables) -> Result<ExecutionOutput<JsonValue>, CacheError> {
    let batches = RefCell::new(Vec::new());
    let loader = loader(records, &batches);
    let source = CacheSource::new(&loader);
    let root = source.root(&CacheKey::query_root())?;
    let schema = schema();
    let executor = Executor::new(&source, &schema, variables);
    executor.execute(query, root, CacheKey::query_root(), &JsonCollector)
}

#[test]
fn reads_through_a_reference() {
    let query = SelectionSet::new("Query").field(Field::new("hero", FieldType::object(name_only("Character"))));
    let out = read_json(&store(), &query, &Variables::new()).unwrap();
    assert_eq!(out.value, json!({"hero": {"name": "Luke Skywalker"}}));
    assert!(out.errors.is_empty());
}

#[test]
fn unmatched_type_cases_are_never_resolved() {
    struct Recording<'a> {
        inner: CacheSource<'a>,
        requested: RefCell<Vec<String>>,
    }
    impl<'a> ExecutionSource<'a> for Recording<'a> {
        type Object = Arc<Record>;
        fn typename(&self, object: &Arc<Record>) -> Option<String> {
            self.inner.typename(object)
        }
        fn object_key(&self, object: &Arc<Record>, typename: &str) -> Option<CacheKey> {
            self.inner.object_key(object, typename)
        }
        fn resolve_field(&self, object: &Arc<Record>, info: &FieldInfo<'_>) -> DeferredValue<'a, Option<SourceValue<'a, Arc<Record>>>> {
            self.requested.borrow_mut().push(info.storage_key.clone());
            self.inner.resolve_field(object, info)
        }
    }

    let records = store();
    let batches = RefCell::new(Vec::new());
    let loader = loader(&records, &batches);
    let source = Recording { inner: CacheSource::new(&loader), requested: RefCell::new(Vec::new()) };
    let hero = name_only("Character").type_case(
        "Droid",
        vec![Selection::Field(Field::new("primaryFunction", FieldType::non_null(FieldType::scalar("String"))))],
    );
    let query = SelectionSet::new("Query").field(Field::new("hero", FieldType::object(hero)));
    let root = source.inner.root(&CacheKey::query_root()).unwrap();
    let schema = schema();
    let variables = Variables::new();
    let out = Executor::new(&source, &schema, &variables).execute(&query, root, CacheKey::query_root(), &JsonCollector).unwrap();

    assert_eq!(out.value, json!({"hero": {"name": "Luke Skywalker"}}));
    assert!(out.errors.is_empty());
    assert!(!source.requested.borrow().contains(&"primaryFunction".to_string()));
}

#[test]
fn matching_type_cases_and_interfaces_are_included() {
    let hero = name_only("Character")
        .type_case("Droid", vec![Selection::Field(Field::new("primaryFunction", FieldType::scalar("String")))])
        .type_case("Character", vec![Selection::Field(Field::typename())]);
    let query = SelectionSet::new("Query").field(Field::new("droid", FieldType::object(hero)));
    let out = read_json(&store(), &query, &Variables::new()).unwrap();
    assert_eq!(out.value, json!({"droid": {"name": "R2-D2", "primaryFunction": "Astromech", "__typename": "Droid"}}));
}

#[test]
fn fragments_conditionals_and_aliases() {
    let details = Arc::new(Fragment::new("HeroDetails", "Human", vec![Selection::Field(Field::new("id", FieldType::scalar("ID")))]));
    let hero = SelectionSet::new("Character")
        .fragment(details)
        .field(Field::new("name", FieldType::scalar("String")).alias("title"))
        .conditional(vec![InclusionCondition::include("withFriends")], vec![Selection::Field(Field::new("friends", FieldType::list(FieldType::object(name_only("Character")))))])
        .conditional(vec![InclusionCondition::skip("withFriends")], vec![Selection::Field(Field::typename())]);
    let query = SelectionSet::new("Query").field(Field::new("hero", FieldType::object(hero)));

    let without = read_json(&store(), &query, &Variables::new()).unwrap();
    assert_eq!(without.value, json!({"hero": {"id": "1000", "title": "Luke Skywalker", "__typename": "Human"}}));

    let vars = json!({"withFriends": true}).as_object().cloned().unwrap();
    let with = read_json(&store(), &query, &vars).unwrap();
    assert_eq!(
        with.value,
        json!({"hero": {"id": "1000", "title": "Luke Skywalker", "friends": [{"name": "Han Solo"}, {"name": "Leia Organa"}, {"name": "R2-D2"}]}})
    );
}

#[test]
fn list_references_are_fetched_in_one_batch() {
    let records = store();
    let batches = RefCell::new(Vec::new());
    let loader = loader(&records, &batches);
    let source = CacheSource::new(&loader);
    let friends = Field::new("friends", FieldType::list(FieldType::object(name_only("Character"))));
    let query = SelectionSet::new("Query").field(Field::new("hero", FieldType::object(name_only("Character").field(friends))));
    let root = source.root(&CacheKey::query_root()).unwrap();
    let schema = schema();
    let variables = Variables::new();
    Executor::new(&source, &schema, &variables).execute(&query, root, CacheKey::query_root(), &JsonCollector).unwrap();

    // root, hero, then all three friends together
    assert_eq!(*batches.borrow(), vec![1, 1, 3]);
}

#[test]
fn dangling_reference_is_a_missing_value_and_siblings_survive() {
    let ghost = SelectionSet::new("Character").field(Field::new("name", FieldType::scalar("String")));
    let query = SelectionSet::new("Query")
        .field(Field::new("ghost", FieldType::object(ghost)))
        .field(Field::new("hero", FieldType::object(name_only("Character"))));
    let out = read_json(&store(), &query, &Variables::new()).unwrap();
    assert_eq!(out.value, json!({"ghost": null, "hero": {"name": "Luke Skywalker"}}));
    assert_eq!(out.errors.len(), 1);
    assert!(matches!(&out.errors[0], CacheError::MissingValue { path } if path.to_string() == "ghost"));
}

#[test]
fn missing_non_null_field_bubbles_to_nearest_nullable_parent() {
    let hero = SelectionSet::new("Character")
        .field(Field::new("name", FieldType::scalar("String")))
        .field(Field::new("height", FieldType::non_null(FieldType::scalar("Float"))));
    let query = SelectionSet::new("Query")
        .field(Field::new("hero", FieldType::object(hero)))
        .field(Field::new("droid", FieldType::object(name_only("Droid"))));
    let out = read_json(&store(), &query, &Variables::new()).unwrap();
    assert_eq!(out.value, json!({"hero": null, "droid": {"name": "R2-D2"}}));
    assert!(matches!(&out.errors[0], CacheError::MissingValue { path } if path.to_string() == "hero.height"));
}

#[test]
fn missing_nullable_field_is_null_without_error() {
    let hero = SelectionSet::new("Character").field(Field::new("height", FieldType::scalar("Float")));
    let query = SelectionSet::new("Query").field(Field::new("hero", FieldType::object(hero)));
    let out = read_json(&store(), &query, &Variables::new()).unwrap();
    assert_eq!(out.value, json!({"hero": {"height": null}}));
    assert!(out.errors.is_empty());
}

#[test]
fn non_null_failure_reaching_the_root_fails_execution() {
    let query = SelectionSet::new("Query").field(Field::new("ghost", FieldType::non_null(FieldType::object(name_only("Character")))));
    assert!(matches!(read_json(&store(), &query, &Variables::new()), Err(CacheError::MissingValue { .. })));
}

#[test]
fn nullable_list_items_fail_individually() {
    let mut records = store();
    let mut crowd = Record::new("QUERY_ROOT");
    crowd.insert("crowd", Value::List(vec![Value::reference("Human:1002"), Value::reference("Human:404")]));
    records.merge([crowd].into_iter().collect());
    let query = SelectionSet::new("Query").field(Field::new("crowd", FieldType::non_null(FieldType::list(FieldType::object(name_only("Character"))))));
    let out = read_json(&records, &query, &Variables::new()).unwrap();
    assert_eq!(out.value, json!({"crowd": [{"name": "Han Solo"}, null]}));
    assert!(matches!(&out.errors[0], CacheError::MissingValue { path } if path.to_string() == "crowd.1"));
}

#[test]
fn shape_mismatch_is_an_unexpected_value() {
    let query = SelectionSet::new("Query").field(Field::new("hero", FieldType::scalar("String")));
    let out = read_json(&store(), &query, &Variables::new()).unwrap();
    assert_eq!(out.value, json!({"hero": null}));
    assert!(matches!(&out.errors[0], CacheError::UnexpectedValue { expected: "scalar", .. }));
}

#[test]
fn forced_type_cast_rejects_other_types() {
    let records = store();
    let batches = RefCell::new(Vec::new());
    let loader = loader(&records, &batches);
    let source = CacheSource::new(&loader);
    let droid = source.root(&CacheKey::from("Droid:2001")).unwrap();
    let schema = schema();
    let variables = Variables::new();
    let executor = Executor::new(&source, &schema, &variables);

    let as_human = executor.execute_as("Human", &name_only("Character"), droid.clone(), CacheKey::from("Droid:2001"), &JsonCollector);
    assert!(matches!(as_human, Err(CacheError::InvalidObjectType { ref expected, ref actual }) if expected == "Human" && actual == "Droid"));

    let as_character = executor.execute_as("Character", &name_only("Character"), droid, CacheKey::from("Droid:2001"), &JsonCollector).unwrap();
    assert_eq!(as_character.value, json!({"name": "R2-D2"}));
}

#[test]
fn fused_accumulators_share_one_walk() {
    #[derive(Deserialize, Debug, PartialEq)]
    struct Hero {
        name: String,
    }
    #[derive(Deserialize, Debug, PartialEq)]
    struct HeroQuery {
        hero: Hero,
    }

    let records = store();
    let batches = RefCell::new(Vec::new());
    let loader = loader(&records, &batches);
    let source = CacheSource::new(&loader);
    let query = SelectionSet::new("Query").field(Field::new("hero", FieldType::object(name_only("Character"))));
    let root = source.root(&CacheKey::query_root()).unwrap();
    let schema = schema();
    let variables = Variables::new();
    let acc = (TypedCollector::<HeroQuery>::default(), Normalizer::default(), DependencyTracker::default());
    let out = Executor::new(&source, &schema, &variables).execute(&query, root, CacheKey::query_root(), &acc).unwrap();
    let (typed, normalized, deps) = out.value;

    assert_eq!(typed, HeroQuery { hero: Hero { name: "Luke Skywalker".into() } });
    assert_eq!(normalized.get("QUERY_ROOT").and_then(|r| r.get("hero")), Some(&Value::reference("Human:1000")));
    assert_eq!(normalized.get("Human:1000").map(|r| r.len()), Some(1));
    assert_eq!(deps, [ChangedKey::new("QUERY_ROOT", "hero"), ChangedKey::new("Human:1000", "name")].into_iter().collect());
    assert_eq!(*batches.borrow(), vec![1, 1]);
}

#[test]
fn response_paths_render_dotted() {
    let path = ResponsePath::root().key("hero").key("friends").index(2).key("name");
    assert_eq!(path.to_string(), "hero.friends.2.name");
    assert_eq!(ResponsePath::root().to_string(), "<root>");
}
