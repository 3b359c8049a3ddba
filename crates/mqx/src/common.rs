//! 📦 Common data structures — the building blocks of marquee.
//!
//! 🎬 COLD OPEN — INT. VIDEO RENTAL STORE — 1997
//!
//! The films sit on shelves sorted by id. Each has a title, maybe a rating,
//! a couple of genres, and a cast that somebody typed into a junction table
//! twice because it was Friday. Our job: walk the shelves in order, read every
//! row, and hand the search cluster one tidy document per film.
//!
//! This module defines the row that comes out of the source ([`FilmRow`]), the
//! document that goes into the target ([`Document`]), and the [`Batch`] that
//! carries documents between them. They don't ask questions. They carry data. 🦆

use serde::{Deserialize, Serialize};

/// 🔗 The stable separator for the flattened `*_names` strings.
///
/// `actors_names.split(NAME_SEPARATOR)` must give back the names in `actors`,
/// so a person name containing this separator is a malformed record.
pub const NAME_SEPARATOR: &str = "; ";

/// 🏷️ The sentinel the source uses for "we don't know". Treated as null.
pub(crate) const NOT_AVAILABLE: &str = "N/A";

/// 🎭 What a person did on a film. Anything else is filtered out at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Actor,
    Writer,
    Director,
}

impl RoleKind {
    /// 🔧 Parse the role column. Case-insensitive, whitespace-tolerant, picky about everything else.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "actor" => Some(Self::Actor),
            "writer" => Some(Self::Writer),
            "director" => Some(Self::Director),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Writer => "writer",
            Self::Director => "director",
        }
    }
}

/// 📄 One flat row out of the relational join: (film, genre?, person?, role?).
///
/// A film with no genres and no cast still produces exactly one row, with the
/// optional columns set to `None`. Rating arrives as raw text because the
/// source has been known to store `"N/A"` in a numeric column. We don't judge.
/// The assembler judges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilmRow {
    pub film_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub rating: Option<String>,
    pub genre: Option<String>,
    pub person_id: Option<String>,
    pub person_name: Option<String>,
    pub role: Option<RoleKind>,
}

impl FilmRow {
    /// 🏗️ A bare film row: id + title, no rating, no genre, no cast.
    pub fn film(film_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            film_id: film_id.into(),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_rating(mut self, rating: impl Into<String>) -> Self {
        self.rating = Some(rating.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    pub fn with_person(
        mut self,
        person_id: impl Into<String>,
        person_name: impl Into<String>,
        role: RoleKind,
    ) -> Self {
        self.person_id = Some(person_id.into());
        self.person_name = Some(person_name.into());
        self.role = Some(role);
        self
    }
}

/// 👤 A person as they appear nested inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: String,
    pub name: String,
}

/// 🎬 The denormalized unit written to the search index. One per film, whole or not at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub imdb_rating: Option<f64>,
    #[serde(default)]
    pub genre: Vec<String>,
    #[serde(default)]
    pub director: Option<String>,
    #[serde(default)]
    pub actors: Vec<PersonRef>,
    #[serde(default)]
    pub actors_names: String,
    #[serde(default)]
    pub writers: Vec<PersonRef>,
    #[serde(default)]
    pub writers_names: String,
}

/// 🔗 Join nested person names with [`NAME_SEPARATOR`], in list order.
pub(crate) fn join_names(people: &[PersonRef]) -> String {
    people
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(NAME_SEPARATOR)
}

/// ✂️ The inverse of [`join_names`]. Empty string ⇔ empty list.
pub(crate) fn split_names(flat: &str) -> Vec<&str> {
    if flat.is_empty() {
        return Vec::new();
    }
    // ✂️ the separator is ASCII, so every hit sits on a char boundary
    let mut names = Vec::new();
    let mut start = 0;
    for hit in memchr::memmem::find_iter(flat.as_bytes(), NAME_SEPARATOR) {
        names.push(&flat[start..hit]);
        start = hit + NAME_SEPARATOR.len();
    }
    names.push(&flat[start..]);
    names
}

/// 📦 A sequenced group of documents headed for one bulk request.
///
/// `seq` is the batch's position in the run; the committer uses it to advance
/// the checkpoint strictly in order even when sink workers finish out of order.
#[derive(Debug, Clone)]
pub(crate) struct Batch {
    pub seq: u64,
    pub documents: Vec<Document>,
    /// 🔖 Highest film id the batch accounts for — where the checkpoint lands once committed.
    /// Covers skipped films too, so it can sit past the last document.
    pub last_film_id: String,
    /// ⚠️ Malformed films dropped while this batch was being filled.
    pub skipped: u64,
}

/// 🚫 A document the target refused inside an otherwise-fine bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub film_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: &str, name: &str) -> PersonRef {
        PersonRef {
            id: id.into(),
            name: name.into(),
        }
    }

    #[test]
    fn the_one_where_names_join_and_split_back_in_order() {
        let cast = vec![person("p1", "Jane"), person("p2", "John Doe")];
        let flat = join_names(&cast);
        assert_eq!(flat, "Jane; John Doe");
        assert_eq!(split_names(&flat), vec!["Jane", "John Doe"]);
    }

    #[test]
    fn the_one_where_nobody_showed_up_and_the_string_is_empty() {
        assert_eq!(join_names(&[]), "");
        assert!(split_names("").is_empty());
    }

    #[test]
    fn the_one_where_roles_parse_with_attitude() {
        assert_eq!(RoleKind::parse(" Actor "), Some(RoleKind::Actor));
        assert_eq!(RoleKind::parse("WRITER"), Some(RoleKind::Writer));
        assert_eq!(RoleKind::parse("director"), Some(RoleKind::Director));
        assert_eq!(RoleKind::parse("caterer"), None);
    }

    #[test]
    fn the_one_where_a_document_keeps_its_nulls_on_the_wire() -> anyhow::Result<()> {
        let doc = Document {
            id: "f1".into(),
            title: "Alpha".into(),
            description: None,
            imdb_rating: Some(7.5),
            genre: vec!["Drama".into()],
            director: None,
            actors: vec![person("p1", "Jane")],
            actors_names: "Jane".into(),
            writers: vec![],
            writers_names: String::new(),
        };
        let wire = serde_json::to_value(&doc)?;
        assert!(wire["description"].is_null());
        assert_eq!(wire["imdb_rating"], 7.5);
        assert_eq!(wire["actors"][0]["name"], "Jane");
        let back: Document = serde_json::from_value(wire)?;
        assert_eq!(back, doc);
        Ok(())
    }
}
