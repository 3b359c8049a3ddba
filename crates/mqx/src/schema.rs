//! 🗺️ Schema Mapper — the target document contract, written down once.
//!
//! The index itself is created outside the migration (or by `mqx create-index`),
//! but the shape lives here: which fields exist, what type they are, which
//! analyzer chews on them, and which relational column feeds each one.
//! Pure data plus one validation function. No network, no feelings. 🦆

use serde_json::{Map, Value, json};

use crate::common::{Document, NAME_SEPARATOR, PersonRef, join_names};
use crate::errors::MigrationError;

/// 📛 Default index name. Configurable, but everyone leaves it alone.
pub const DEFAULT_INDEX: &str = "movies";

/// 🌍 The dual-language analyzer name used by every full-text field.
pub const TEXT_ANALYZER: &str = "ru_en";

/// 🧬 Field types the target understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Keyword,
    Float,
    Text,
    Nested,
}

/// 📐 One field of the target document.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// 🔒 Must be present and non-empty on every document.
    pub required: bool,
    /// 🔧 Adds a `raw` keyword sub-field next to the analyzed text.
    pub keyword_subfield: bool,
    /// 🪆 Sub-fields for `Nested` fields; empty otherwise.
    pub properties: &'static [FieldSpec],
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
        keyword_subfield: false,
        properties: &[],
    }
}

const PERSON_PROPERTIES: &[FieldSpec] = &[
    FieldSpec {
        required: true,
        ..field("id", FieldKind::Keyword)
    },
    field("name", FieldKind::Text),
];

/// 🎬 The movies document, field by field.
pub const MOVIES_SCHEMA: &[FieldSpec] = &[
    FieldSpec {
        required: true,
        ..field("id", FieldKind::Keyword)
    },
    field("imdb_rating", FieldKind::Float),
    field("genre", FieldKind::Keyword),
    FieldSpec {
        required: true,
        keyword_subfield: true,
        ..field("title", FieldKind::Text)
    },
    field("description", FieldKind::Text),
    field("director", FieldKind::Text),
    field("actors_names", FieldKind::Text),
    field("writers_names", FieldKind::Text),
    FieldSpec {
        properties: PERSON_PROPERTIES,
        ..field("actors", FieldKind::Nested)
    },
    FieldSpec {
        properties: PERSON_PROPERTIES,
        ..field("writers", FieldKind::Nested)
    },
];

/// 🔀 Where each document field comes from in the relational source.
pub const FIELD_MAPPING: &[(&str, &str)] = &[
    ("film_work.id", "id"),
    ("film_work.title", "title"),
    ("film_work.description", "description"),
    ("film_work.rating", "imdb_rating"),
    ("genre.name (via genre_film_work)", "genre"),
    ("person.full_name where role = director", "director"),
    ("person.{id, full_name} where role = actor", "actors / actors_names"),
    ("person.{id, full_name} where role = writer", "writers / writers_names"),
];

fn field_mapping(field: &FieldSpec) -> Value {
    match field.kind {
        FieldKind::Keyword => json!({ "type": "keyword" }),
        FieldKind::Float => json!({ "type": "float" }),
        FieldKind::Text if field.keyword_subfield => json!({
            "type": "text",
            "analyzer": TEXT_ANALYZER,
            "fields": { "raw": { "type": "keyword" } }
        }),
        FieldKind::Text => json!({ "type": "text", "analyzer": TEXT_ANALYZER }),
        FieldKind::Nested => json!({
            "type": "nested",
            "dynamic": "strict",
            "properties": properties(field.properties)
        }),
    }
}

fn properties(specs: &[FieldSpec]) -> Value {
    let mut props = Map::new();
    for field in specs {
        props.insert(field.name.to_string(), field_mapping(field));
    }
    Value::Object(props)
}

/// 📜 Index settings + mappings, exactly as the target contract describes them.
///
/// Lowercase → English stop words → English stemmer → English possessive
/// stemmer → Russian stop words → Russian stemmer. `dynamic: strict`, so a
/// document carrying a stray field is rejected per-document by the target.
pub fn index_definition() -> Value {
    json!({
        "settings": {
            "refresh_interval": "1s",
            "analysis": {
                "filter": {
                    "english_stop": { "type": "stop", "stopwords": "_english_" },
                    "english_stemmer": { "type": "stemmer", "language": "english" },
                    "english_possessive_stemmer": { "type": "stemmer", "language": "possessive_english" },
                    "russian_stop": { "type": "stop", "stopwords": "_russian_" },
                    "russian_stemmer": { "type": "stemmer", "language": "russian" }
                },
                "analyzer": {
                    TEXT_ANALYZER: {
                        "tokenizer": "standard",
                        "filter": [
                            "lowercase",
                            "english_stop",
                            "english_stemmer",
                            "english_possessive_stemmer",
                            "russian_stop",
                            "russian_stemmer"
                        ]
                    }
                }
            }
        },
        "mappings": {
            "dynamic": "strict",
            "properties": properties(MOVIES_SCHEMA)
        }
    })
}

fn check_people(film_id: &str, role: &str, people: &[PersonRef], flat: &str) -> Result<(), MigrationError> {
    for person in people {
        if person.id.trim().is_empty() {
            return Err(MigrationError::malformed(film_id, format!("{role} with an empty id")));
        }
        if person.name.trim().is_empty() {
            return Err(MigrationError::malformed(
                film_id,
                format!("{role} '{}' has an empty name", person.id),
            ));
        }
        if person.name.contains(NAME_SEPARATOR) {
            return Err(MigrationError::malformed(
                film_id,
                format!("{role} '{}' name contains the separator {NAME_SEPARATOR:?}", person.id),
            ));
        }
    }
    if join_names(people) != flat {
        return Err(MigrationError::malformed(
            film_id,
            format!("{role}s_names does not match the nested {role}s list"),
        ));
    }
    Ok(())
}

/// ✅ Validate an assembled document against [`MOVIES_SCHEMA`].
///
/// Required fields present and non-empty, rating finite or null, nested ids
/// non-empty, flattened names consistent with the nested lists.
pub fn validate(doc: &Document) -> Result<(), MigrationError> {
    for field in MOVIES_SCHEMA.iter().filter(|s| s.required) {
        let empty = match field.name {
            "id" => doc.id.trim().is_empty(),
            "title" => doc.title.trim().is_empty(),
            _ => false,
        };
        if empty {
            return Err(MigrationError::malformed(
                doc.id.clone(),
                format!("required field '{}' is missing or empty", field.name),
            ));
        }
    }
    if let Some(rating) = doc.imdb_rating {
        if !rating.is_finite() {
            return Err(MigrationError::malformed(
                doc.id.clone(),
                format!("imdb_rating {rating} is not a finite number"),
            ));
        }
    }
    if doc.genre.iter().any(|g| g.trim().is_empty()) {
        return Err(MigrationError::malformed(doc.id.clone(), "empty genre label"));
    }
    check_people(&doc.id, "actor", &doc.actors, &doc.actors_names)?;
    check_people(&doc.id, "writer", &doc.writers, &doc.writers_names)?;
    Ok(())
}
