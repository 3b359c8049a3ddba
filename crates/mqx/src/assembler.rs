//! 🧩 Document Assembler — rows in, documents out, one film at a time.
//!
//! 🎬 *[a conveyor belt of flat rows. the same film id, again, and again, and again.]*
//! *[then: a new id. the belt pauses. a document is born.]*
//!
//! The assembler is a stateful fold over an id-ordered row stream. It holds
//! exactly one film's worth of state. When the film id changes (the group
//! boundary), the previous film is finished, validated, and emitted. Nothing
//! else is buffered, so memory stays flat no matter how big the catalogue is.
//!
//! ⚠️ The whole trick depends on the extractor handing rows over sorted by film
//! id. If ids ever go backwards we stop the run, because the alternative is
//! two half-documents for the same film fighting over one `_id`. 🦆

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::common::{Document, FilmRow, NOT_AVAILABLE, PersonRef, RoleKind, join_names};
use crate::errors::MigrationError;
use crate::schema;

/// 📤 What falls out of the fold when a group closes.
#[derive(Debug, Clone)]
pub(crate) enum Assembled {
    /// ✅ A valid document, ready for a batch.
    Document(Document),
    /// ⚠️ A film that could not be assembled. Always a `MalformedRecord`.
    Skipped(MigrationError),
}

/// 🎬 Everything we know about the film currently on the belt.
#[derive(Debug)]
struct FilmGroup {
    film_id: String,
    title: Option<String>,
    description: Option<String>,
    rating: Option<String>,
    genres: BTreeSet<String>,
    actors: Vec<PersonRef>,
    writers: Vec<PersonRef>,
    directors: Vec<PersonRef>,
    seen: HashSet<(RoleKind, String)>,
}

/// 🧹 `None`, blank, and `"N/A"` all mean "absent".
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| {
        let trimmed = v.trim();
        !trimmed.is_empty() && trimmed != NOT_AVAILABLE
    })
}

impl FilmGroup {
    fn start(row: FilmRow) -> Self {
        let mut group = Self {
            film_id: row.film_id.clone(),
            title: row.title.clone(),
            description: row.description.clone(),
            rating: row.rating.clone(),
            genres: BTreeSet::new(),
            actors: Vec::new(),
            writers: Vec::new(),
            directors: Vec::new(),
            seen: HashSet::new(),
        };
        group.absorb(row);
        group
    }

    fn absorb(&mut self, row: FilmRow) {
        if let Some(genre) = present(row.genre) {
            self.genres.insert(genre.trim().to_string());
        }

        let (Some(person_id), Some(role)) = (row.person_id, row.role) else {
            return;
        };
        let Some(name) = present(row.person_name) else {
            debug!("🙈 film '{}': {} '{}' has no usable name, leaving them out", self.film_id, role.as_str(), person_id);
            return;
        };
        // 🔁 same person, same role, same film: first sighting wins, the rest are echoes
        if !self.seen.insert((role, person_id.clone())) {
            return;
        }
        let person = PersonRef {
            id: person_id,
            name: name.trim().to_string(),
        };
        match role {
            RoleKind::Actor => self.actors.push(person),
            RoleKind::Writer => self.writers.push(person),
            RoleKind::Director => self.directors.push(person),
        }
    }

    fn finish(self) -> Assembled {
        let film_id = self.film_id;

        let imdb_rating = match present(self.rating) {
            None => None,
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(rating) => Some(rating),
                Err(_) => {
                    return Assembled::Skipped(MigrationError::malformed(
                        film_id,
                        format!("rating '{raw}' is not numeric"),
                    ));
                }
            },
        };

        if self.directors.len() > 1 {
            warn!(
                "🎬 film '{}' has {} directors, which is {} more than convention allows; keeping them all in one string",
                film_id,
                self.directors.len(),
                self.directors.len() - 1
            );
        }
        let director = (!self.directors.is_empty()).then(|| {
            self.directors
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        });

        let document = Document {
            actors_names: join_names(&self.actors),
            writers_names: join_names(&self.writers),
            id: film_id,
            title: self.title.unwrap_or_default(),
            description: present(self.description),
            imdb_rating,
            genre: self.genres.into_iter().collect(),
            director,
            actors: self.actors,
            writers: self.writers,
        };

        match schema::validate(&document) {
            Ok(()) => Assembled::Document(document),
            Err(err) => Assembled::Skipped(err),
        }
    }
}

/// 🧩 The fold itself. Feed it rows with [`Assembler::push`], drain it with [`Assembler::finish`].
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    current: Option<FilmGroup>,
    last_closed: Option<String>,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🔄 Absorb one row. Returns the previous film when this row starts a new one.
    ///
    /// 💀 Errors with `SourceQueryError` if the row's film id sorts before a
    /// film that was already closed: the stream is not id-ordered and
    /// grouping can no longer be trusted.
    pub(crate) fn push(&mut self, row: FilmRow) -> Result<Option<Assembled>, MigrationError> {
        if let Some(group) = self.current.as_mut() {
            if group.film_id == row.film_id {
                group.absorb(row);
                return Ok(None);
            }
            if row.film_id < group.film_id {
                return Err(MigrationError::source_query(format!(
                    "rows are not ordered by film id: '{}' arrived after '{}'",
                    row.film_id, group.film_id
                )));
            }
        } else if let Some(last) = self.last_closed.as_deref() {
            if row.film_id.as_str() <= last {
                return Err(MigrationError::source_query(format!(
                    "rows are not ordered by film id: '{}' arrived after '{}'",
                    row.film_id, last
                )));
            }
        }

        let finished = self.current.replace(FilmGroup::start(row));
        Ok(finished.map(|group| self.close(group)))
    }

    /// 🏁 End of stream: emit whatever film is still on the belt.
    pub(crate) fn finish(&mut self) -> Option<Assembled> {
        self.current.take().map(|group| self.close(group))
    }

    fn close(&mut self, group: FilmGroup) -> Assembled {
        self.last_closed = Some(group.film_id.clone());
        group.finish()
    }
}

/// 📚 Assemble a complete, id-ordered row set in one go. Used by the verifier.
pub(crate) fn assemble_all(rows: Vec<FilmRow>) -> Result<Vec<Assembled>, MigrationError> {
    let mut assembler = Assembler::new();
    let mut out = Vec::new();
    for row in rows {
        if let Some(done) = assembler.push(row)? {
            out.push(done);
        }
    }
    out.extend(assembler.finish());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn documents(rows: Vec<FilmRow>) -> Result<Vec<Document>> {
        Ok(assemble_all(rows)?
            .into_iter()
            .filter_map(|a| match a {
                Assembled::Document(d) => Some(d),
                Assembled::Skipped(_) => None,
            })
            .collect())
    }

    #[test]
    fn the_one_where_alpha_becomes_a_document() -> Result<()> {
        // 🧪 f1 "Alpha", 7.5, Drama, one actor Jane, no writers, no director
        let rows = vec![
            FilmRow::film("f1", "Alpha")
                .with_rating("7.5")
                .with_genre("Drama")
                .with_person("p1", "Jane", RoleKind::Actor),
        ];
        let docs = documents(rows)?;
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.id, "f1");
        assert_eq!(doc.title, "Alpha");
        assert_eq!(doc.imdb_rating, Some(7.5));
        assert_eq!(doc.genre, vec!["Drama".to_string()]);
        assert_eq!(
            doc.actors,
            vec![PersonRef {
                id: "p1".into(),
                name: "Jane".into()
            }]
        );
        assert_eq!(doc.actors_names, "Jane");
        assert!(doc.writers.is_empty());
        assert_eq!(doc.writers_names, "");
        assert_eq!(doc.director, None);
        Ok(())
    }

    #[test]
    fn the_one_where_jane_is_listed_twice_but_shows_up_once() -> Result<()> {
        let base = FilmRow::film("f1", "Alpha").with_rating("7.5").with_genre("Drama");
        let rows = vec![
            base.clone().with_person("p1", "Jane", RoleKind::Actor),
            base.clone().with_person("p1", "Jane", RoleKind::Actor),
        ];
        let docs = documents(rows)?;
        assert_eq!(docs[0].actors.len(), 1);
        assert_eq!(docs[0].actors_names, "Jane");
        Ok(())
    }

    #[test]
    fn the_one_where_genres_times_cast_collapses_back_down() -> Result<()> {
        // 🧪 2 genres × 3 people = 6 rows of cross-product; order of first sighting must survive
        let base = FilmRow::film("f1", "Alpha");
        let mut rows = Vec::new();
        for (pid, name, role) in [
            ("p2", "Bob", RoleKind::Actor),
            ("p1", "Ann", RoleKind::Actor),
            ("w1", "Wes", RoleKind::Writer),
        ] {
            for genre in ["Drama", "Comedy"] {
                rows.push(base.clone().with_genre(genre).with_person(pid, name, role));
            }
        }
        let doc = &documents(rows)?[0];
        assert_eq!(doc.genre, vec!["Comedy".to_string(), "Drama".to_string()]);
        let names: Vec<_> = doc.actors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Bob", "Ann"]);
        assert_eq!(doc.actors_names, "Bob; Ann");
        assert_eq!(doc.writers_names, "Wes");
        Ok(())
    }

    #[test]
    fn the_one_where_the_same_person_acts_and_writes() -> Result<()> {
        let base = FilmRow::film("f1", "Alpha");
        let rows = vec![
            base.clone().with_person("p1", "Jane", RoleKind::Actor),
            base.clone().with_person("p1", "Jane", RoleKind::Writer),
            base.clone().with_person("d1", "Dora", RoleKind::Director),
        ];
        let doc = &documents(rows)?[0];
        assert_eq!(doc.actors_names, "Jane");
        assert_eq!(doc.writers_names, "Jane");
        assert_eq!(doc.director.as_deref(), Some("Dora"));
        Ok(())
    }

    #[test]
    fn the_one_where_not_available_means_nothing_at_all() -> Result<()> {
        let base = FilmRow::film("f1", "Alpha")
            .with_rating("N/A")
            .with_description("N/A");
        let rows = vec![
            base.clone().with_person("p0", "N/A", RoleKind::Actor),
            base.clone().with_person("p1", "Jane", RoleKind::Actor),
        ];
        let doc = &documents(rows)?[0];
        assert_eq!(doc.imdb_rating, None);
        assert_eq!(doc.description, None);
        assert_eq!(doc.actors_names, "Jane");
        Ok(())
    }

    #[test]
    fn the_one_where_a_lonely_film_has_no_friends_and_no_genres() -> Result<()> {
        let doc = &documents(vec![FilmRow::film("f9", "Solo")])?[0];
        assert!(doc.genre.is_empty());
        assert!(doc.actors.is_empty());
        assert_eq!(doc.actors_names, "");
        Ok(())
    }

    #[test]
    fn the_one_where_a_garbage_rating_gets_the_film_skipped() -> Result<()> {
        let rows = vec![
            FilmRow::film("f1", "Alpha").with_rating("seven-ish"),
            FilmRow::film("f2", "Beta").with_rating("6"),
        ];
        let out = assemble_all(rows)?;
        assert!(matches!(&out[0], Assembled::Skipped(MigrationError::MalformedRecord { film_id, .. }) if film_id == "f1"));
        assert!(matches!(&out[1], Assembled::Document(d) if d.id == "f2"));
        Ok(())
    }

    #[test]
    fn the_one_where_a_group_boundary_emits_the_previous_film() -> Result<()> {
        let mut assembler = Assembler::new();
        assert!(assembler.push(FilmRow::film("f1", "Alpha"))?.is_none());
        assert!(assembler.push(FilmRow::film("f1", "Alpha").with_genre("Drama"))?.is_none());
        let emitted = assembler.push(FilmRow::film("f2", "Beta"))?;
        assert!(matches!(emitted, Some(Assembled::Document(ref d)) if d.id == "f1" && d.genre == vec!["Drama".to_string()]));
        assert!(matches!(assembler.finish(), Some(Assembled::Document(ref d)) if d.id == "f2"));
        assert!(assembler.finish().is_none());
        Ok(())
    }

    #[test]
    fn the_one_where_ids_go_backwards_and_we_refuse_to_play() -> Result<()> {
        let mut assembler = Assembler::new();
        assembler.push(FilmRow::film("f2", "Beta"))?;
        let err = assembler
            .push(FilmRow::film("f1", "Alpha"))
            .expect_err("💀 out-of-order ids must stop the fold");
        assert!(matches!(err, MigrationError::SourceQueryError(_)));
        Ok(())
    }

    #[test]
    fn the_one_where_every_document_obeys_the_name_order_invariant() -> Result<()> {
        // 🧪 a small grid of casts; for each doc, split(names) == nested names
        let mut rows = Vec::new();
        for film in 0..20 {
            let id = format!("f{film:03}");
            let base = FilmRow::film(&id, format!("Film {film}"));
            rows.push(base.clone());
            for person in 0..(film % 5) {
                let pid = format!("p{}", (film * 7 + person) % 11);
                rows.push(base.clone().with_person(&pid, format!("Person {pid}"), RoleKind::Actor));
                rows.push(base.clone().with_person(&pid, format!("Person {pid}"), RoleKind::Writer));
                rows.push(base.clone().with_person(&pid, format!("Person {pid}"), RoleKind::Actor));
            }
        }
        for doc in documents(rows)? {
            let actors: Vec<_> = doc.actors.iter().map(|a| a.name.as_str()).collect();
            assert_eq!(crate::common::split_names(&doc.actors_names), actors);
            let writers: Vec<_> = doc.writers.iter().map(|w| w.name.as_str()).collect();
            assert_eq!(crate::common::split_names(&doc.writers_names), writers);
            let unique: HashSet<_> = doc.actors.iter().map(|a| &a.id).collect();
            assert_eq!(unique.len(), doc.actors.len(), "dedup invariant broken for {}", doc.id);
        }
        Ok(())
    }
}
