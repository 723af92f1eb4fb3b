#![allow(dead_code)]

use normcache::{CacheKey, Field, FieldType, Record, RecordSet, SchemaTypes, Selection, SelectionSet, Value};
use std::path::PathBuf;

pub fn temp_path(prefix: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}.{}", prefix, rand::random::<u64>(), ext))
}

pub fn star_wars() -> SchemaTypes {
    SchemaTypes::new().interface("Character", ["Human", "Droid"]).union("SearchResult", ["Human", "Droid", "Starship"])
}

/// `QUERY_ROOT.hero -> Human:1000`
pub fn scenario_a() -> RecordSet {
    let mut root = Record::new(CacheKey::QUERY_ROOT);
    root.insert("hero", Value::reference("Human:1000"));
    let mut luke = Record::new("Human:1000");
    luke.insert("__typename", "Human");
    luke.insert("id", "1000");
    luke.insert("name", "Luke Skywalker");
    [root, luke].into_iter().collect()
}

pub fn name_field() -> Field {
    Field::new("name", FieldType::non_null(FieldType::scalar("String")))
}

/// `{ hero { name } }`
pub fn hero_name() -> SelectionSet {
    let hero = SelectionSet::new("Character").field(name_field());
    SelectionSet::new("Query").field(Field::new("hero", FieldType::object(hero)))
}

/// `{ hero { __typename id name ... on Droid { primaryFunction } } }`
pub fn hero_with_droid_case() -> SelectionSet {
    let hero = SelectionSet::new("Character")
        .field(Field::typename())
        .field(Field::new("id", FieldType::non_null(FieldType::scalar("ID"))))
        .field(name_field())
        .type_case("Droid", vec![Selection::from(Field::new("primaryFunction", FieldType::non_null(FieldType::scalar("String"))))]);
    SelectionSet::new("Query").field(Field::new("hero", FieldType::object(hero)))
}
